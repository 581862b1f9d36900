use super::fixtures::{identity_qf, serial_ceed};
use feop::context::{as_scalars, SharedContextBuffer};
use feop::prelude::*;

fn scaling_qf(ctx: &Context) -> QFunction {
    QFunction::create(1, |data, q, inputs, outputs| {
        let alpha = data.map(as_scalars).and_then(|s| s.first().copied()).unwrap_or(0.0);
        for i in 0..q {
            outputs[0][i] = alpha * inputs[0][i];
        }
        Ok(())
    })
    .input("u", 1, EvalMode::None)
    .unwrap()
    .output("v", 1, EvalMode::None)
    .unwrap()
    .context(ctx)
}

fn collocated_operator(ceed: &Ceed, qf: &QFunction) -> Operator {
    let restriction = ceed.elem_restriction(2, 2, 1, 1, 4, &[0, 1, 2, 3]).unwrap();
    ceed.operator(qf, QFunctionOpt::None, QFunctionOpt::None)
        .unwrap()
        .field("u", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
        .field("v", &restriction, BasisOpt::Collocated, VectorOpt::Active)
        .unwrap()
}

#[test]
fn second_borrow_fails_until_restored() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[1.0]).unwrap();

    let data = ctx.get_data(MemType::Host).unwrap();
    let err = ctx.get_data(MemType::Host).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    data.restore().unwrap();

    let data = ctx.get_data(MemType::Host).unwrap();
    data.restore().unwrap();
}

#[test]
fn restore_without_borrow_fails() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[1.0]).unwrap();
    assert_eq!(ctx.restore_data().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn destroy_while_borrowed_fails() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[1.0]).unwrap();
    let other = ctx.clone();
    let data = ctx.get_data(MemType::Host).unwrap();
    assert_eq!(other.destroy().unwrap_err().kind(), ErrorKind::InvalidState);
    data.restore().unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn written_data_reaches_the_pointwise_function() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[2.0]).unwrap();
    let op = collocated_operator(&ceed, &scaling_qf(&ctx));

    let u = ceed.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let v = ceed.vector(4);
    op.apply(&u, &v, Request::Immediate).unwrap();
    assert_eq!(v.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);

    let mut data = ctx.get_data(MemType::Host).unwrap();
    data.copy_from_scalars(&[-1.0]);
    data.restore().unwrap();
    op.apply(&u, &v, Request::Immediate).unwrap();
    assert_eq!(v.to_vec(), vec![-1.0, -2.0, -3.0, -4.0]);
}

#[test]
fn apply_with_borrowed_context_leaves_output_untouched() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[2.0]).unwrap();
    let op = collocated_operator(&ceed, &scaling_qf(&ctx));

    let u = ceed.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let v = ceed.vector_from_slice(&[9.0; 4]);
    let data = ctx.get_data(MemType::Host).unwrap();
    let err = op.apply(&u, &v, Request::Immediate).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(v.to_vec(), vec![9.0; 4]);
    data.restore().unwrap();
}

#[test]
fn apply_fails_while_a_restored_view_is_still_alive() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[2.0]).unwrap();
    let op = collocated_operator(&ceed, &scaling_qf(&ctx));

    let u = ceed.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let v = ceed.vector_from_slice(&[9.0; 4]);
    let data = ctx.get_data(MemType::Host).unwrap();
    ctx.restore_data().unwrap();
    let err = op.apply(&u, &v, Request::Immediate).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(v.to_vec(), vec![9.0; 4]);

    drop(data);
    op.apply(&u, &v, Request::Immediate).unwrap();
    assert_eq!(v.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn resizing_a_shared_buffer_is_detected() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    let buffer = SharedContextBuffer::new(parking_lot::Mutex::new(2.0f64.to_ne_bytes().to_vec()));
    ctx.set_data(MemType::Host, ContextSource::UsePointer(buffer.clone()))
        .unwrap();
    let op = collocated_operator(&ceed, &scaling_qf(&ctx));
    let u = ceed.vector_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let v = ceed.vector(4);
    op.apply(&u, &v, Request::Immediate).unwrap();

    buffer.lock().extend_from_slice(&[0; 8]);
    let err = op.apply(&u, &v, Request::Immediate).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleShape);
    assert_eq!(ctx.size(), 8);
}

#[test]
fn context_is_shared_between_functions() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[1.0]).unwrap();
    let qf = identity_qf(1, EvalMode::None).context(&ctx);
    let _other = scaling_qf(&ctx);
    assert_eq!(ctx.reference_count(), 3);
    drop(qf);
    assert_eq!(ctx.reference_count(), 2);
}

#[test]
fn context_view() {
    let ceed = serial_ceed();
    let ctx = ceed.context();
    ctx.set_scalars(MemType::Host, &[1.0, 2.0]).unwrap();

    let mut buffer = Vec::new();
    ctx.view(&mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    insta::assert_snapshot!(text, @r###"
    UserContext
      Context Data Size: 16
      Memory: Host
      Copy Mode: OwnPointer
    "###);
}
