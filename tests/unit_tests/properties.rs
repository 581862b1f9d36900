use super::fixtures::{boundary_operator, identity_qf, serial_ceed, MassProblem};
use feop::prelude::*;
use feop::proptest::{offset_restriction, RestrictionParams};
use proptest::collection::vec;
use proptest::prelude::*;
use std::sync::OnceLock;

fn problem() -> &'static MassProblem {
    static PROBLEM: OnceLock<MassProblem> = OnceLock::new();
    PROBLEM.get_or_init(|| MassProblem::square(serial_ceed(), 3, 3, 3, 3, 2))
}

fn input_vector() -> impl Strategy<Value = Vec<f64>> {
    vec(-5.0..5.0, problem().lvector_size())
}

proptest! {
    #[test]
    fn apply_is_deterministic(values in input_vector()) {
        let op = problem().mass_operator();
        let u = Vector::from_slice(&values);
        let v1 = problem().restriction.create_lvector();
        let v2 = problem().restriction.create_lvector();
        op.apply(&u, &v1, Request::Immediate).unwrap();
        op.apply(&u, &v2, Request::Ordered).unwrap();
        prop_assert_eq!(v1.to_vec(), v2.to_vec());
    }

    #[test]
    fn apply_add_into_zero_equals_apply(values in input_vector()) {
        let op = problem().mass_operator();
        let u = Vector::from_slice(&values);
        let v_apply = problem().restriction.create_lvector();
        let v_add = problem().restriction.create_lvector();
        op.apply(&u, &v_apply, Request::Immediate).unwrap();
        op.apply_add(&u, &v_add, Request::Immediate).unwrap();
        prop_assert_eq!(v_apply.to_vec(), v_add.to_vec());
    }

    #[test]
    fn repeated_apply_is_idempotent(values in input_vector()) {
        let op = problem().mass_operator();
        let u = Vector::from_slice(&values);
        let v = problem().restriction.create_lvector();
        op.apply(&u, &v, Request::Immediate).unwrap();
        let once = v.to_vec();
        op.apply(&u, &v, Request::Immediate).unwrap();
        prop_assert_eq!(once, v.to_vec());
    }

    #[test]
    fn composite_action_is_sum_of_actions(values in input_vector(), nested in any::<bool>()) {
        let problem = problem();
        let ceed = &problem.ceed;
        let n = problem.lvector_size();
        let u = Vector::from_slice(&values);

        let expected = problem.restriction.create_lvector();
        problem.mass_operator().apply(&u, &expected, Request::Immediate).unwrap();
        boundary_operator(ceed, n).apply_add(&u, &expected, Request::Immediate).unwrap();

        let mass = problem.mass_operator();
        let composite = if nested {
            let inner = ceed.composite_operator().sub_operator(mass).unwrap();
            ceed.composite_operator().sub_operator(inner).unwrap()
        } else {
            ceed.composite_operator().sub_operator(mass).unwrap()
        };
        let composite = composite.sub_operator(boundary_operator(ceed, n)).unwrap();
        let v = problem.restriction.create_lvector();
        v.set_value(7.0);
        composite.apply(&u, &v, Request::Immediate).unwrap();
        prop_assert_eq!(v.to_vec(), expected.to_vec());
    }

    #[test]
    fn collocated_identity_applies_transpose_times_restriction(
        (restriction, values) in offset_restriction(RestrictionParams::default())
            .prop_flat_map(|r| {
                let n = r.lvector_size();
                (Just(r), vec(-5.0..5.0, n))
            })
    ) {
        // The operator is R^T R, which the restriction can compute on its own
        let ceed = serial_ceed();
        let ncomp = restriction.num_components();
        let op = ceed
            .operator(&identity_qf(ncomp, EvalMode::None), QFunctionOpt::None, QFunctionOpt::None)
            .unwrap()
            .field("u", &restriction, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap()
            .field("v", &restriction, BasisOpt::Collocated, VectorOpt::Active)
            .unwrap();

        let u = Vector::from_slice(&values);
        let v = restriction.create_lvector();
        op.apply(&u, &v, Request::Immediate).unwrap();

        let e = restriction.create_evector();
        restriction.apply(TransposeMode::NoTranspose, &u, &e).unwrap();
        let expected = restriction.create_lvector();
        restriction.apply(TransposeMode::Transpose, &e, &expected).unwrap();
        prop_assert_eq!(v.to_vec(), expected.to_vec());

        // Diagonal of R^T R counts how often each entry is referenced
        let diagonal = restriction.create_lvector();
        op.linear_assemble_diagonal(&diagonal, Request::Immediate).unwrap();
        let ones = restriction.create_evector();
        ones.set_value(1.0);
        let counts = restriction.create_lvector();
        restriction.apply(TransposeMode::Transpose, &ones, &counts).unwrap();
        prop_assert_eq!(diagonal.to_vec(), counts.to_vec());
    }
}
