use super::fixtures::{dense_matrix, identity_qf, serial_ceed, MassProblem};
use feop::prelude::*;
use matrixcompare::assert_matrix_eq;
use util::assert_approx_slice_eq;

fn collocated_identity(ceed: &Ceed, restriction: &ElemRestriction) -> Operator {
    ceed.operator(&identity_qf(1, EvalMode::None), QFunctionOpt::None, QFunctionOpt::None)
        .unwrap()
        .field("u", restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("v", restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
}

#[test]
fn identity_diagonal_is_ones() {
    let ceed = serial_ceed();
    let restriction = ceed.elem_restriction(3, 2, 1, 1, 6, &[0, 1, 2, 3, 4, 5]).unwrap();
    let op = collocated_identity(&ceed, &restriction);
    let diagonal = ceed.vector_from_slice(&[-1.0; 6]);
    op.linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap();
    assert_eq!(diagonal.to_vec(), vec![1.0; 6]);
}

#[test]
fn shared_dofs_sum_diagonal_contributions() {
    let ceed = serial_ceed();
    let restriction = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let op = collocated_identity(&ceed, &restriction);
    let diagonal = ceed.vector(3);
    op.linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap();
    assert_eq!(diagonal.to_vec(), vec![1.0, 2.0, 1.0]);

    op.linear_assemble_add_diagonal(&diagonal, Request::Immediate)
        .unwrap();
    assert_eq!(diagonal.to_vec(), vec![2.0, 4.0, 2.0]);
}

#[test]
fn mass_diagonal_matches_dense_matrix() {
    let problem = MassProblem::square(serial_ceed(), 2, 3, 3, 4, 1);
    let op = problem.mass_operator();
    let n = problem.lvector_size();
    let matrix = dense_matrix(&op, n);

    let diagonal = problem.restriction.create_lvector();
    op.linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap();
    assert_matrix_eq!(diagonal.to_dvector(), matrix.diagonal(), comp = abs, tol = 1e-14);
}

#[test]
fn mass_point_block_diagonal_matches_brute_force() {
    let ncomp = 2;
    let problem = MassProblem::square(serial_ceed(), 2, 3, 3, 4, ncomp);
    let op = problem.mass_operator();
    let num_nodes = problem.num_nodes;

    let assembled = problem.ceed.vector(ncomp * ncomp * num_nodes);
    op.linear_assemble_point_block_diagonal(&assembled, Request::Immediate)
        .unwrap();

    // Column (node i, component j) of the operator, restricted to the components of node i
    let mut expected = vec![0.0; ncomp * ncomp * num_nodes];
    let u = problem.restriction.create_lvector();
    let v = problem.restriction.create_lvector();
    for i in 0..num_nodes {
        for j in 0..ncomp {
            u.set_value(0.0);
            u.view_mut()[i + j * num_nodes] = 1.0;
            op.apply(&u, &v, Request::Immediate).unwrap();
            let v = v.to_vec();
            for k in 0..ncomp {
                expected[i * ncomp * ncomp + k * ncomp + j] += v[i + k * num_nodes];
            }
        }
    }
    assert_approx_slice_eq!(assembled.to_vec(), expected, abstol = 1e-14);
}

#[test]
fn point_block_output_length_is_checked() {
    let problem = MassProblem::line(serial_ceed(), 3, 2, 2);
    let op = problem.mass_operator();
    let wrong = problem.ceed.vector(problem.num_nodes + 1);
    let err = op
        .linear_assemble_point_block_diagonal(&wrong, Request::Immediate)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleShape);
}

#[test]
fn nonlinear_operator_cannot_be_assembled() {
    let ceed = serial_ceed();
    let restriction = ceed.elem_restriction(1, 2, 1, 1, 2, &[0, 1]).unwrap();
    let qf = QFunction::create(1, |_, q, inputs, outputs| {
        for i in 0..q {
            outputs[0][i] = inputs[0][i] * inputs[0][i];
        }
        Ok(())
    })
    .input("u", 1, EvalMode::None)
    .unwrap()
    .output("v", 1, EvalMode::None)
    .unwrap()
    .nonlinear();
    let op = ceed
        .operator(&qf, QFunctionOpt::None, QFunctionOpt::None)
        .unwrap()
        .field("u", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("v", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();
    let diagonal = ceed.vector(2);
    let err = op
        .linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLinear);
}

#[test]
fn multiple_active_inputs_are_unsupported() {
    let ceed = serial_ceed();
    let restriction = ceed.elem_restriction(1, 2, 1, 1, 2, &[0, 1]).unwrap();
    let qf = QFunction::create(1, |_, q, inputs, outputs| {
        for i in 0..q {
            outputs[0][i] = inputs[0][i] + inputs[1][i];
        }
        Ok(())
    })
    .input("a", 1, EvalMode::None)
    .unwrap()
    .input("b", 1, EvalMode::None)
    .unwrap()
    .output("v", 1, EvalMode::None)
    .unwrap();
    let op = ceed
        .operator(&qf, QFunctionOpt::None, QFunctionOpt::None)
        .unwrap()
        .field("a", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("b", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("v", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap();
    let diagonal = ceed.vector(2);
    let err = op
        .linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedShape);
}

#[test]
fn composite_diagonal_is_sum_of_diagonals() {
    let ceed = serial_ceed();
    let a = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let b = ceed.elem_restriction(1, 2, 1, 1, 3, &[0, 2]).unwrap();
    let composite = ceed
        .composite_operator()
        .sub_operator(collocated_identity(&ceed, &a))
        .unwrap()
        .sub_operator(collocated_identity(&ceed, &b))
        .unwrap();
    let diagonal = ceed.vector_from_slice(&[5.0; 3]);
    composite
        .linear_assemble_diagonal(&diagonal, Request::Immediate)
        .unwrap();
    assert_eq!(diagonal.to_vec(), vec![2.0, 2.0, 2.0]);
}
