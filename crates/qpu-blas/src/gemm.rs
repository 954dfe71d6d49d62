/// Storage order of a matrix, with the CBLAS values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Order {
    /// Rows are contiguous.
    RowMajor = 101,
    /// Columns are contiguous.
    ColMajor = 102,
}

/// How an operand enters the product, with the CBLAS values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Transpose {
    /// `op(X) = X`
    NoTrans = 111,
    /// `op(X) = Xᵀ`
    Trans = 112,
    /// `op(X) = Xᴴ`, the same as `Trans` for real matrices.
    ConjTrans = 113,
}

impl Transpose {
    fn is_transposed(self) -> bool {
        !matches!(self, Self::NoTrans)
    }
}

/// Returns the number of elements a `rows` x `cols` matrix with leading dimension `ld`
/// spans in the given storage order.
pub(crate) fn required_len(order: Order, rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    match order {
        Order::ColMajor => {
            assert!(ld >= rows, "leading dimension {ld} is smaller than {rows} rows");
            ld * (cols - 1) + rows
        }
        Order::RowMajor => {
            assert!(ld >= cols, "leading dimension {ld} is smaller than {cols} columns");
            ld * (rows - 1) + cols
        }
    }
}

/// Returns the stored shape of an operand whose `op` is `rows` x `cols`.
fn stored_shape(trans: Transpose, rows: usize, cols: usize) -> (usize, usize) {
    if trans.is_transposed() {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

#[allow(clippy::too_many_arguments)]
fn check_operands(
    order: Order,
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &[f32],
    ldc: usize,
) {
    let (a_rows, a_cols) = stored_shape(trans_a, m, k);
    let (b_rows, b_cols) = stored_shape(trans_b, k, n);
    assert!(
        a.len() >= required_len(order, a_rows, a_cols, lda),
        "A size mismatch"
    );
    assert!(
        b.len() >= required_len(order, b_rows, b_cols, ldb),
        "B size mismatch"
    );
    assert!(c.len() >= required_len(order, m, n, ldc), "C size mismatch");
}

/// Reference single-precision GEMM computed with a plain triple loop.
///
/// Computes `C := alpha * op(A) * B + beta * C` where `op(A)` is `m` x `k`, `B` is `k` x `n`
/// and `C` is `m` x `n`. When `beta` is zero `C` is not read, so it may be uninitialized.
///
/// # Panics
///
/// Panics unless `order` is [`Order::ColMajor`], `trans_a` is [`Transpose::NoTrans`] or
/// [`Transpose::Trans`] and `trans_b` is [`Transpose::NoTrans`], or if a slice is too short
/// for its shape and leading dimension.
///
/// # Example
///
/// ```
/// use qpu_blas::gemm::{naive_sgemm, Order, Transpose};
///
/// // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]], column-major
/// let a = [1.0, 3.0, 2.0, 4.0];
/// let b = [5.0, 7.0, 6.0, 8.0];
/// let mut c = [0.0; 4];
/// naive_sgemm(
///     Order::ColMajor,
///     Transpose::NoTrans,
///     Transpose::NoTrans,
///     2, 2, 2,
///     1.0, &a, 2, &b, 2,
///     0.0, &mut c, 2,
/// );
/// assert_eq!(c, [19.0, 43.0, 22.0, 50.0]);
/// ```
#[allow(clippy::too_many_arguments)]
pub fn naive_sgemm(
    order: Order,
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    assert!(
        matches!(trans_a, Transpose::NoTrans | Transpose::Trans),
        "Unsupported transpose for A: {trans_a:?}"
    );
    assert_eq!(trans_b, Transpose::NoTrans, "Unsupported transpose for B");
    assert_eq!(order, Order::ColMajor, "Unsupported order");
    check_operands(order, trans_a, trans_b, m, n, k, a, lda, b, ldb, c, ldc);

    for j in 0..n {
        for i in 0..m {
            let mut total = 0.0f32;
            for l in 0..k {
                let a_index = match trans_a {
                    Transpose::NoTrans => lda * l + i,
                    _ => lda * i + l,
                };
                total += a[a_index] * b[ldb * j + l];
            }
            let c_index = ldc * j + i;
            c[c_index] = if beta == 0.0 {
                alpha * total
            } else {
                alpha * total + beta * c[c_index]
            };
        }
    }
}

fn element_strides(order: Order, trans: Transpose, ld: usize) -> (isize, isize) {
    let ld = ld as isize;
    let (row, col) = match order {
        Order::ColMajor => (1, ld),
        Order::RowMajor => (ld, 1),
    };
    if trans.is_transposed() {
        (col, row)
    } else {
        (row, col)
    }
}

/// Optimized single-precision GEMM backed by `matrixmultiply::sgemm`.
///
/// Computes `C := alpha * op(A) * op(B) + beta * C` in either storage order. Used as the
/// timing and correctness reference for the QPU path.
///
/// # Panics
///
/// Panics if a slice is too short for its shape and leading dimension.
#[allow(clippy::too_many_arguments)]
pub fn library_sgemm(
    order: Order,
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    check_operands(order, trans_a, trans_b, m, n, k, a, lda, b, ldb, c, ldc);

    let (rsa, csa) = element_strides(order, trans_a, lda);
    let (rsb, csb) = element_strides(order, trans_b, ldb);
    let (rsc, csc) = element_strides(order, Transpose::NoTrans, ldc);

    // SAFETY: check_operands verified every addressed element lies inside its slice
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            alpha,
            a.as_ptr(),
            rsa,
            csa,
            b.as_ptr(),
            rsb,
            csb,
            beta,
            c.as_mut_ptr(),
            rsc,
            csc,
        );
    }
}
