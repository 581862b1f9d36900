use feop::prelude::*;
use feop::proptest::{offset_restriction, RestrictionParams};
use proptest::prelude::*;

#[test]
fn restriction_gathers_in_component_major_order() {
    let ceed = Ceed::init("/cpu/self").unwrap();
    // Two components stored with stride 3
    let restriction = ceed.elem_restriction(2, 2, 2, 3, 6, &[0, 1, 1, 2]).unwrap();
    let u = ceed.vector_from_slice(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    let e = restriction.create_evector();
    restriction.apply(TransposeMode::NoTranspose, &u, &e).unwrap();
    assert_eq!(e.to_vec(), vec![1.0, 2.0, 10.0, 20.0, 2.0, 3.0, 20.0, 30.0]);
}

#[test]
fn restriction_transpose_accumulates_shared_nodes() {
    let ceed = Ceed::init("/cpu/self").unwrap();
    let restriction = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let e = ceed.vector_from_slice(&[1.0, 2.0, 2.0, 3.0]);
    let v = restriction.create_lvector();
    restriction.apply(TransposeMode::Transpose, &e, &v).unwrap();
    assert_eq!(v.to_vec(), vec![1.0, 4.0, 3.0]);
}

#[test]
fn restriction_rejects_wrong_vector_lengths() {
    let ceed = Ceed::init("/cpu/self").unwrap();
    let restriction = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let u = ceed.vector(4);
    let e = restriction.create_evector();
    let err = restriction.apply(TransposeMode::NoTranspose, &u, &e).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleShape);
}

#[test]
fn equivalent_restrictions_compare_by_layout() {
    let ceed = Ceed::init("/cpu/self").unwrap();
    let a = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let b = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let c = ceed.elem_restriction(2, 2, 1, 1, 3, &[0, 1, 2, 1]).unwrap();
    assert!(!a.same_restriction(&b));
    assert!(a.equivalent(&b));
    assert!(!a.equivalent(&c));
}

proptest! {
    #[test]
    fn transpose_is_adjoint_of_restriction(
        (restriction, u, w) in offset_restriction(RestrictionParams::default())
            .prop_flat_map(|r| {
                let (l, e) = (r.lvector_size(), r.evector_size());
                (Just(r), feop::proptest::vector(l), feop::proptest::vector(e))
            })
    ) {
        // <R u, w> == <u, R^T w>
        let ru = restriction.create_evector();
        restriction.apply(TransposeMode::NoTranspose, &u, &ru).unwrap();
        let rtw = restriction.create_lvector();
        restriction.apply(TransposeMode::Transpose, &w, &rtw).unwrap();

        let lhs: f64 = ru.to_vec().iter().zip(w.to_vec()).map(|(a, b)| a * b).sum();
        let rhs: f64 = u.to_vec().iter().zip(rtw.to_vec()).map(|(a, b)| a * b).sum();
        prop_assert!((lhs - rhs).abs() <= 1e-10 * (1.0 + lhs.abs()));
    }
}
