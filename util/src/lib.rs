use nalgebra::{DMatrix, DVector};

/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = $x - $y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

/// Approx assertion for slices of `f64`, comparing entry by entry.
#[macro_export]
macro_rules! assert_approx_slice_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let x: &[f64] = &$x;
        let y: &[f64] = &$y;
        assert_eq!(x.len(), y.len(), "slices have different lengths");
        let max_absdiff = x
            .iter()
            .zip(y)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        if max_absdiff > $tol {
            println!("abstol: {:e}", $tol);
            println!("left: {:?}", x);
            println!("right: {:?}", y);
            println!("max abs diff: {:e}", max_absdiff);
        }
        assert!(max_absdiff <= $tol);
    }};
}

/// Points and weights of the `n`-point Gauss-Legendre rule on `[-1, 1]`.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    assert!(n > 0, "Gauss-Legendre rule needs at least one point");
    let mut points = vec![0.0; n];
    let mut weights = vec![0.0; n];
    for i in 0..n {
        // Chebyshev initial guess, refined with Newton's method
        let mut x = -(std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut derivative = 0.0;
        for _ in 0..100 {
            let (p, dp) = legendre(n, x);
            derivative = dp;
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let (_, dp) = legendre(n, x);
        if dp != 0.0 {
            derivative = dp;
        }
        points[i] = x;
        weights[i] = 2.0 / ((1.0 - x * x) * derivative * derivative);
    }
    (points, weights)
}

/// Value and derivative of the Legendre polynomial of degree `n` at `x`.
fn legendre(n: usize, x: f64) -> (f64, f64) {
    let (mut p0, mut p1) = (1.0, x);
    if n == 0 {
        return (1.0, 0.0);
    }
    for k in 2..=n {
        let k = k as f64;
        let p2 = ((2.0 * k - 1.0) * x * p1 - (k - 1.0) * p0) / k;
        p0 = p1;
        p1 = p2;
    }
    let n = n as f64;
    (p1, n * (x * p1 - p0) / (x * x - 1.0))
}

/// Lagrange basis on `p` equispaced nodes in `[-1, 1]`, evaluated at the `q` Gauss points.
///
/// Returns the `q x p` interpolation matrix, the `q x p` derivative matrix and the
/// quadrature weights.
pub fn lagrange_basis_1d(p: usize, q: usize) -> (DMatrix<f64>, DMatrix<f64>, DVector<f64>) {
    assert!(p >= 2, "need at least two nodes");
    let nodes: Vec<f64> = (0..p)
        .map(|i| -1.0 + 2.0 * i as f64 / (p - 1) as f64)
        .collect();
    let (points, weights) = gauss_legendre(q);

    let mut interp = DMatrix::zeros(q, p);
    let mut grad = DMatrix::zeros(q, p);
    for (k, &x) in points.iter().enumerate() {
        for j in 0..p {
            let mut value = 1.0;
            let mut derivative = 0.0;
            for m in 0..p {
                if m == j {
                    continue;
                }
                let denom = nodes[j] - nodes[m];
                let mut term = 1.0 / denom;
                for l in 0..p {
                    if l != j && l != m {
                        term *= (x - nodes[l]) / (nodes[j] - nodes[l]);
                    }
                }
                derivative += term;
                value *= (x - nodes[m]) / denom;
            }
            interp[(k, j)] = value;
            grad[(k, j)] = derivative;
        }
    }
    (interp, grad, DVector::from_vec(weights))
}

/// Tensor product of a 1D Lagrange basis on the reference square.
///
/// Nodes are numbered `iy * p + ix`, quadrature points `qy * q + qx`. The gradient matrix
/// stacks the x derivatives on top of the y derivatives.
pub fn lagrange_basis_2d(p: usize, q: usize) -> (DMatrix<f64>, DMatrix<f64>, DVector<f64>) {
    let (b, d, w) = lagrange_basis_1d(p, q);
    let mut interp = DMatrix::zeros(q * q, p * p);
    let mut grad = DMatrix::zeros(2 * q * q, p * p);
    let mut weights = DVector::zeros(q * q);
    for qy in 0..q {
        for qx in 0..q {
            let row = qy * q + qx;
            weights[row] = w[qx] * w[qy];
            for iy in 0..p {
                for ix in 0..p {
                    let col = iy * p + ix;
                    interp[(row, col)] = b[(qx, ix)] * b[(qy, iy)];
                    grad[(row, col)] = d[(qx, ix)] * b[(qy, iy)];
                    grad[(q * q + row, col)] = b[(qx, ix)] * d[(qy, iy)];
                }
            }
        }
    }
    (interp, grad, weights)
}

/// Element-to-node offsets of a uniform 1D mesh with `num_elements` elements of `p` nodes.
pub fn line_mesh_offsets(num_elements: usize, p: usize) -> Vec<usize> {
    (0..num_elements)
        .flat_map(|e| (0..p).map(move |i| e * (p - 1) + i))
        .collect()
}

/// Element-to-node offsets of a uniform `nx x ny` quadrilateral mesh with `p x p` nodes per
/// element, with nodes numbered row by row.
pub fn quad_mesh_offsets(nx: usize, ny: usize, p: usize) -> Vec<usize> {
    let nodes_x = nx * (p - 1) + 1;
    let mut offsets = Vec::with_capacity(nx * ny * p * p);
    for ey in 0..ny {
        for ex in 0..nx {
            for iy in 0..p {
                for ix in 0..p {
                    let gx = ex * (p - 1) + ix;
                    let gy = ey * (p - 1) + iy;
                    offsets.push(gy * nodes_x + gx);
                }
            }
        }
    }
    offsets
}
