/// The highest rank a [`Dimensions`] can describe.
pub const MAX_DIMENSIONS: usize = 4;

/// An immutable shape of one to four positive extents.
///
/// Offsets are row-major: the last axis is contiguous.
///
/// # Example
///
/// ```
/// use qpu_tensor::Dimensions;
///
/// let dims = Dimensions::from([2, 3, 4]);
/// assert_eq!(dims.element_count(), 24);
/// assert_eq!(dims.offset(&[1, 2, 3]), 23);
/// assert_eq!(dims.remove_dimensions(1), Dimensions::from([3, 4]));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    dims: [usize; MAX_DIMENSIONS],
    len: usize,
}

impl Dimensions {
    /// Creates a shape from its extents.
    ///
    /// # Panics
    ///
    /// Panics if there are no extents, more than [`MAX_DIMENSIONS`], or any extent is zero.
    pub fn new(extents: &[usize]) -> Self {
        assert!(
            !extents.is_empty() && extents.len() <= MAX_DIMENSIONS,
            "Dimensions must have between 1 and {MAX_DIMENSIONS} extents, got {}",
            extents.len()
        );
        assert!(
            extents.iter().all(|&d| d > 0),
            "Dimensions must be positive, got {extents:?}"
        );
        let mut dims = [0; MAX_DIMENSIONS];
        dims[..extents.len()].copy_from_slice(extents);
        Self {
            dims,
            len: extents.len(),
        }
    }

    /// Returns the number of axes.
    #[inline]
    pub fn rank(&self) -> usize {
        self.len
    }

    /// Returns the extents.
    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.dims[..self.len]
    }

    /// Returns the product of all extents.
    pub fn element_count(&self) -> usize {
        self.as_slice().iter().product()
    }

    /// Returns the row-major strides, in elements.
    pub fn strides(&self) -> [usize; MAX_DIMENSIONS] {
        let mut strides = [0; MAX_DIMENSIONS];
        let mut stride = 1;
        for i in (0..self.len).rev() {
            strides[i] = stride;
            stride *= self.dims[i];
        }
        strides
    }

    /// Returns the linear offset of an element.
    ///
    /// # Panics
    ///
    /// Panics if the number of indices differs from the rank, or in debug builds if an
    /// index is outside its extent.
    pub fn offset(&self, indices: &[usize]) -> usize {
        assert_eq!(
            indices.len(),
            self.len,
            "Expected {} indices for {self}, got {}",
            self.len,
            indices.len()
        );
        let strides = self.strides();
        indices
            .iter()
            .zip(self.as_slice())
            .zip(strides.iter())
            .fold(0, |acc, ((&index, &extent), &stride)| {
                debug_assert!(index < extent, "Index {index} out of bounds for {self}");
                acc + index * stride
            })
    }

    /// Returns a shape with the first `count` axes dropped.
    ///
    /// # Panics
    ///
    /// Panics if `count` is not smaller than the rank.
    pub fn remove_dimensions(&self, count: usize) -> Self {
        assert!(
            count < self.len,
            "Can't remove {count} dimensions from {self}"
        );
        Self::new(&self.dims[count..self.len])
    }
}

impl<const N: usize> From<[usize; N]> for Dimensions {
    fn from(extents: [usize; N]) -> Self {
        Self::new(&extents)
    }
}

impl std::ops::Index<usize> for Dimensions {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.as_slice()[index]
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl std::fmt::Debug for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dimensions{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count_and_last_offset() {
        for extents in [
            vec![7],
            vec![3, 5],
            vec![2, 3, 4],
            vec![2, 1, 3, 5],
            vec![3025, 363],
        ] {
            let dims = Dimensions::new(&extents);
            let count: usize = extents.iter().product();
            assert_eq!(dims.element_count(), count);
            let last: Vec<usize> = extents.iter().map(|d| d - 1).collect();
            assert_eq!(dims.offset(&last), count - 1);
            assert_eq!(dims.offset(&vec![0; extents.len()]), 0);
        }
    }

    #[test]
    fn test_offset_is_row_major() {
        let dims = Dimensions::from([2, 3, 4]);
        assert_eq!(dims.strides()[..3], [12, 4, 1]);
        assert_eq!(dims.offset(&[1, 0, 0]), 12);
        assert_eq!(dims.offset(&[0, 1, 0]), 4);
        assert_eq!(dims.offset(&[0, 0, 1]), 1);
    }

    #[test]
    fn test_remove_dimensions() {
        let dims = Dimensions::from([1, 480, 640]);
        let image = dims.remove_dimensions(1);
        assert_eq!(image, Dimensions::from([480, 640]));
        assert_eq!(image.rank(), 2);
        assert_eq!(image[0], 480);
    }

    #[test]
    #[should_panic]
    fn test_remove_all_dimensions_panics() {
        Dimensions::from([1, 2]).remove_dimensions(2);
    }

    #[test]
    #[should_panic]
    fn test_offset_with_wrong_rank_panics() {
        Dimensions::from([2, 3]).offset(&[1]);
    }

    #[test]
    #[should_panic]
    fn test_zero_extent_panics() {
        Dimensions::from([2, 0]);
    }

    #[test]
    #[should_panic]
    fn test_rank_five_panics() {
        Dimensions::new(&[1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Dimensions::from([3025, 363]).to_string(), "[3025, 363]");
        assert_eq!(format!("{:?}", Dimensions::from([4])), "Dimensions[4]");
    }
}
