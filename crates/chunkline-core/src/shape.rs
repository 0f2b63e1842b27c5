use smallvec::SmallVec;
use std::fmt;

/// Dimensions of a chunk tensor, inline for up to four axes.
///
/// The sequence (token) axis is always last: hidden state is
/// `[1, hidden, 1, seq]`, caches are `[1, heads * dim, 1, seq]`. Everything
/// sequence-aware here works on the trailing axis and treats the rest as
/// rows.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Element count; 1 for a rank-0 shape.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Length of the sequence axis, `None` for rank 0.
    pub fn last_dim(&self) -> Option<usize> {
        self.dims.last().copied()
    }

    /// Number of rows of length `last_dim()` in the row-major buffer.
    pub fn outer_size(&self) -> usize {
        self.dims
            .split_last()
            .map_or(1, |(_, leading)| leading.iter().product())
    }

    /// Same leading axes, sequence axis free to differ.
    pub fn matches_except_last(&self, other: &Shape) -> bool {
        match (self.dims.split_last(), other.dims.split_last()) {
            (Some((_, a)), Some((_, b))) => a == b,
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}
