//! Shared problem setups: mass operators on uniform line and quadrilateral meshes.
use feop::prelude::*;
use util::{lagrange_basis_1d, lagrange_basis_2d, line_mesh_offsets, quad_mesh_offsets};

pub fn serial_ceed() -> Ceed {
    Ceed::init("/cpu/self/ref/serial").unwrap()
}

pub fn batched_ceed(block_size: usize) -> Ceed {
    let resource = Resource::parse("/cpu/self/par").unwrap().with_block_size(block_size);
    Ceed::from_resource(resource).unwrap()
}

/// Copies its single input to its single output.
pub fn identity_qf(size: usize, eval_mode: EvalMode) -> QFunction {
    QFunction::create(1, move |_, q, inputs, outputs| {
        outputs[0][..size * q].copy_from_slice(&inputs[0][..size * q]);
        Ok(())
    })
    .input("u", size, eval_mode)
    .unwrap()
    .output("v", size, eval_mode)
    .unwrap()
}

/// Stores `w * det(dx/dX)` at every quadrature point.
pub fn setup_qf(dim: usize) -> QFunction {
    QFunction::create(1, move |_, q, inputs, outputs| {
        let (dx, weights) = (inputs[0], inputs[1]);
        for i in 0..q {
            // dx is laid out [direction * dim + component][q]
            let j = |c: usize, d: usize| dx[(d * dim + c) * q + i];
            let det = match dim {
                1 => j(0, 0),
                2 => j(0, 0) * j(1, 1) - j(0, 1) * j(1, 0),
                _ => eyre::bail!("unsupported dimension {dim}"),
            };
            outputs[0][i] = weights[i] * det;
        }
        Ok(())
    })
    .input("dx", dim * dim, EvalMode::Grad)
    .unwrap()
    .input("weights", 1, EvalMode::Weight)
    .unwrap()
    .output("qdata", 1, EvalMode::None)
    .unwrap()
}

/// `v_c = qdata * u_c` for every component `c`.
pub fn mass_qf(ncomp: usize) -> QFunction {
    QFunction::create(1, move |_, q, inputs, outputs| {
        let (qdata, u) = (inputs[0], inputs[1]);
        for c in 0..ncomp {
            for i in 0..q {
                outputs[0][c * q + i] = qdata[i] * u[c * q + i];
            }
        }
        Ok(())
    })
    .input("qdata", 1, EvalMode::None)
    .unwrap()
    .input("u", ncomp, EvalMode::Interp)
    .unwrap()
    .output("v", ncomp, EvalMode::Interp)
    .unwrap()
}

/// Everything needed to build mass operators on a uniform mesh of the unit line or square.
pub struct MassProblem {
    pub ceed: Ceed,
    pub num_nodes: usize,
    pub ncomp: usize,
    pub restriction: ElemRestriction,
    pub qdata_restriction: ElemRestriction,
    pub basis: Basis,
    pub qdata: Vector,
}

impl MassProblem {
    /// `num_elements` elements with `p` nodes and `q` quadrature points each on the unit line.
    pub fn line(ceed: Ceed, num_elements: usize, p: usize, q: usize) -> Self {
        let num_nodes = num_elements * (p - 1) + 1;
        let offsets = line_mesh_offsets(num_elements, p);
        let restriction = ceed
            .elem_restriction(num_elements, p, 1, 1, num_nodes, &offsets)
            .unwrap();
        let (interp, grad, weights) = lagrange_basis_1d(p, q);
        let basis = ceed.basis_H1(1, 1, interp, grad, weights.as_slice()).unwrap();
        let coords: Vec<f64> = (0..num_nodes)
            .map(|k| k as f64 / (num_nodes - 1) as f64)
            .collect();
        let x = ceed.vector_from_slice(&coords);
        Self::with_geometry(ceed, num_nodes, 1, restriction.clone(), &restriction, &basis, basis.clone(), &x, q)
    }

    /// `nx x ny` quadrilaterals with `p x p` nodes, `q x q` quadrature points and `ncomp`
    /// solution components stored with component stride equal to the number of nodes.
    pub fn square(ceed: Ceed, nx: usize, ny: usize, p: usize, q: usize, ncomp: usize) -> Self {
        let (nodes_x, nodes_y) = (nx * (p - 1) + 1, ny * (p - 1) + 1);
        let num_nodes = nodes_x * nodes_y;
        let num_elements = nx * ny;
        let offsets = quad_mesh_offsets(nx, ny, p);

        let x_restriction = ceed
            .elem_restriction(num_elements, p * p, 2, num_nodes, 2 * num_nodes, &offsets)
            .unwrap();
        let restriction = ceed
            .elem_restriction(num_elements, p * p, ncomp, num_nodes, ncomp * num_nodes, &offsets)
            .unwrap();

        let (interp, grad, weights) = lagrange_basis_2d(p, q);
        let x_basis = ceed
            .basis_H1(2, 2, interp.clone(), grad.clone(), weights.as_slice())
            .unwrap();
        let basis = ceed
            .basis_H1(2, ncomp, interp, grad, weights.as_slice())
            .unwrap();

        let mut coords = vec![0.0; 2 * num_nodes];
        for gy in 0..nodes_y {
            for gx in 0..nodes_x {
                let n = gy * nodes_x + gx;
                coords[n] = gx as f64 / (nodes_x - 1) as f64;
                coords[num_nodes + n] = gy as f64 / (nodes_y - 1) as f64;
            }
        }
        let x = ceed.vector_from_slice(&coords);
        Self::with_geometry(ceed, num_nodes, ncomp, restriction, &x_restriction, &x_basis, basis, &x, q * q)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_geometry(
        ceed: Ceed,
        num_nodes: usize,
        ncomp: usize,
        restriction: ElemRestriction,
        x_restriction: &ElemRestriction,
        x_basis: &Basis,
        basis: Basis,
        x: &Vector,
        num_qpoints: usize,
    ) -> Self {
        let num_elements = restriction.num_elements();
        let qdata_restriction = ceed
            .strided_elem_restriction(
                num_elements,
                num_qpoints,
                1,
                num_elements * num_qpoints,
                [1, num_qpoints, num_qpoints],
            )
            .unwrap();
        let qdata = qdata_restriction.create_lvector();
        let setup = ceed
            .operator(&setup_qf(x_basis.dim()), QFunctionOpt::None, QFunctionOpt::None)
            .unwrap()
            .field("dx", x_restriction, x_basis, VectorOpt::Active)
            .unwrap()
            .field("weights", ElemRestrictionOpt::None, x_basis, VectorOpt::None)
            .unwrap()
            .field("qdata", &qdata_restriction, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap();
        setup.apply(x, &qdata, Request::Immediate).unwrap();

        Self {
            ceed,
            num_nodes,
            ncomp,
            restriction,
            qdata_restriction,
            basis,
            qdata,
        }
    }

    pub fn lvector_size(&self) -> usize {
        self.restriction.lvector_size()
    }

    pub fn mass_operator(&self) -> Operator {
        self.mass_operator_on(&self.ceed)
    }

    /// A mass operator sharing the geometric data of this problem, executed by `ceed`.
    pub fn mass_operator_on(&self, ceed: &Ceed) -> Operator {
        ceed.operator(&mass_qf(self.ncomp), QFunctionOpt::None, QFunctionOpt::None)
            .unwrap()
            .field("qdata", &self.qdata_restriction, BasisOpt::Collocated, &self.qdata)
            .unwrap()
            .field("u", &self.restriction, &self.basis, VectorOpt::Active)
            .unwrap()
            .field("v", &self.restriction, &self.basis, VectorOpt::Active)
            .unwrap()
    }
}

/// Apply `op` to every unit vector and collect the columns of its matrix, column-major.
pub fn dense_matrix<O: OperatorApply>(op: &O, n: usize) -> nalgebra::DMatrix<f64> {
    let mut matrix = nalgebra::DMatrix::zeros(n, n);
    let u = Vector::zeros(n);
    let v = Vector::zeros(n);
    for j in 0..n {
        u.set_value(0.0);
        u.view_mut()[j] = 1.0;
        op.apply(&u, &v, Request::Immediate).unwrap();
        matrix.column_mut(j).copy_from_slice(&v.to_vec());
    }
    matrix
}

/// Scales the values of the boundary nodes `0` and `n - 1`, as a stand-in for a surface term.
pub fn boundary_operator(ceed: &Ceed, num_nodes: usize) -> Operator {
    let restriction = ceed
        .elem_restriction(2, 1, 1, 1, num_nodes, &[0, num_nodes - 1])
        .unwrap();
    let qf = QFunction::create(1, |_, q, inputs, outputs| {
        for i in 0..q {
            outputs[0][i] = 10.0 * inputs[0][i];
        }
        Ok(())
    })
    .input("u", 1, EvalMode::None)
    .unwrap()
    .output("v", 1, EvalMode::None)
    .unwrap();
    ceed.operator(&qf, QFunctionOpt::None, QFunctionOpt::None)
        .unwrap()
        .field("u", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("v", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
}
