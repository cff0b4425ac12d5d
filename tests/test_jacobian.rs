use std::sync::Arc;
use daesens::{
    BlockRequest, DaeOutputs, DaeSystem, Error, InputSel, Integrator,
    OptValue, Options, OutputSel, ResidualFn, Schema,
};

macro_rules! assert_eq_tol {
    ($left: expr, $right: expr, $tol: expr) => {
        let (left, right, tol) = ($left, $right, $tol);
        assert!((left - right).abs() <= tol,
                "|{} - {}| > {}", left, right, tol);
    }
}

fn opts() -> Options {
    Options::new(Schema::integrator())
}

/// ẋ = −p·x: everything about it is known in closed form.
fn decay() -> DaeSystem {
    DaeSystem::explicit(1, 0, 1, |g, v| {
        let px = g.mul(v.p[0], v.x[0]);
        let rhs = g.neg(px);
        DaeOutputs { ode: vec![rhs], alg: vec![], quad: vec![] }
    }).unwrap()
}

#[test]
fn state_and_parameter_blocks_of_linear_decay() -> Result<(), Error> {
    let (x0, p, tf) = (1.5, 0.8, 1.);
    let mut ivp = Integrator::new(decay(), 0., tf, opts())?;
    let blocks = ivp.jacobian(&[x0], &[p], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
        BlockRequest::new(OutputSel::FinalState, InputSel::None),
    ])?;
    assert_eq!(blocks.len(), 3);
    let f = (-p * tf).exp();
    let d_x0 = blocks[0].matrix().unwrap();
    assert_eq!(d_x0.dim(), (1, 1));
    assert_eq_tol!(d_x0[(0, 0)], f, 1e-4);
    let d_p = blocks[1].matrix().unwrap();
    assert_eq!(d_p.dim(), (1, 1));
    assert_eq_tol!(d_p[(0, 0)], -tf * x0 * f, 1e-4);
    let xf = blocks[2].value().unwrap();
    assert_eq_tol!(xf[0], x0 * f, 1e-4);
    Ok(())
}

#[test]
fn block_dimensions_follow_the_request() -> Result<(), Error> {
    // Two decoupled decays plus a parameter-driven clock quadrature.
    let dae = DaeSystem::explicit(2, 0, 3, |g, v| {
        let r0 = g.mul(v.p[0], v.x[0]);
        let r1 = g.mul(v.p[1], v.x[1]);
        DaeOutputs {
            ode: vec![g.neg(r0), g.neg(r1)],
            alg: vec![],
            quad: vec![v.p[2]],
        }
    }).unwrap();
    let mut ivp = Integrator::new(dae, 0., 2., opts())?;
    let blocks = ivp.jacobian(&[1., -1.], &[0.5, 1., 3.], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
        BlockRequest::new(OutputSel::FinalQuad, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalQuad, InputSel::Parameters),
    ])?;
    let d_xf_x0 = blocks[0].matrix().unwrap();
    let d_xf_p = blocks[1].matrix().unwrap();
    let d_qf_x0 = blocks[2].matrix().unwrap();
    let d_qf_p = blocks[3].matrix().unwrap();
    assert_eq!(d_xf_x0.dim(), (2, 2));
    assert_eq!(d_xf_p.dim(), (2, 3));
    assert_eq!(d_qf_x0.dim(), (1, 2));
    assert_eq!(d_qf_p.dim(), (1, 3));

    // The decays do not couple and ignore p₂; q = p₂·t sees only p₂.
    assert_eq_tol!(d_xf_x0[(0, 0)], (-1f64).exp(), 1e-4);
    assert_eq_tol!(d_xf_x0[(1, 1)], (-2f64).exp(), 1e-4);
    assert_eq_tol!(d_xf_x0[(0, 1)], 0., 1e-8);
    assert_eq_tol!(d_xf_x0[(1, 0)], 0., 1e-8);
    assert_eq_tol!(d_xf_p[(0, 0)], -2. * (-1f64).exp(), 1e-4);
    assert_eq_tol!(d_xf_p[(0, 1)], 0., 1e-8);
    assert_eq_tol!(d_xf_p[(0, 2)], 0., 1e-8);
    assert_eq_tol!(d_qf_x0[(0, 0)], 0., 1e-8);
    assert_eq_tol!(d_qf_p[(0, 2)], 2., 1e-4);
    Ok(())
}

#[test]
fn quadrature_sensitivity_of_an_integral() -> Result<(), Error> {
    // q = ∫₀ᵀ x dt = x₀(1 − e^{−T}), so ∂q/∂x₀ = 1 − e^{−T}.
    let dae = DaeSystem::explicit(1, 0, 0, |g, v| {
        let r = g.neg(v.x[0]);
        DaeOutputs { ode: vec![r], alg: vec![], quad: vec![v.x[0]] }
    }).unwrap();
    let mut ivp = Integrator::new(dae, 0., 1., opts())?;
    let blocks = ivp.jacobian(&[2.], &[], &[
        BlockRequest::new(OutputSel::FinalQuad, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalQuad, InputSel::None),
    ])?;
    let d_q = blocks[0].matrix().unwrap();
    assert_eq!(d_q.dim(), (1, 1));
    assert_eq_tol!(d_q[(0, 0)], 1. - (-1f64).exp(), 1e-4);
    let qf = blocks[1].value().unwrap();
    assert_eq_tol!(qf[0], 2. * (1. - (-1f64).exp()), 1e-4);
    Ok(())
}

#[test]
fn algebraic_constraints_are_differentiated_too() -> Result<(), Error> {
    // ẋ = −z with 0 = z − p·x collapses to ẋ = −p·x, Jacobians
    // included.
    let dae = DaeSystem::explicit(1, 1, 1, |g, v| {
        let px = g.mul(v.p[0], v.x[0]);
        let r = g.sub(v.z[0], px);
        DaeOutputs { ode: vec![g.neg(v.z[0])], alg: vec![r], quad: vec![] }
    }).unwrap();
    let mut ivp = Integrator::new(dae, 0., 1., opts())?;
    let blocks = ivp.jacobian(&[1.], &[1.], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
    ])?;
    let f = (-1f64).exp();
    assert_eq_tol!(blocks[0].matrix().unwrap()[(0, 0)], f, 1e-3);
    assert_eq_tol!(blocks[1].matrix().unwrap()[(0, 0)], -f, 1e-3);
    Ok(())
}

#[test]
fn implicit_residual_form_gives_the_same_jacobians() -> Result<(), Error> {
    let dae = DaeSystem::implicit(1, 0, 1, |g, v| {
        let px = g.mul(v.p[0], v.x[0]);
        let r = g.add(v.xdot[0], px);
        DaeOutputs { ode: vec![r], alg: vec![], quad: vec![] }
    }).unwrap();
    let mut ivp = Integrator::new(dae, 0., 1., opts())?;
    let blocks = ivp.jacobian(&[1.], &[1.], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
    ])?;
    let f = (-1f64).exp();
    assert_eq_tol!(blocks[0].matrix().unwrap()[(0, 0)], f, 1e-3);
    assert_eq_tol!(blocks[1].matrix().unwrap()[(0, 0)], -f, 1e-3);
    Ok(())
}

#[test]
fn finite_difference_option_matches_forward_sensitivities()
    -> Result<(), Error> {
    let requests = [
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
    ];
    let mut fwd = Integrator::new(decay(), 0., 1., opts())?;
    let fwd_blocks = fwd.jacobian(&[1.], &[1.], &requests)?;

    let o = opts().with("finite_difference_fsens", OptValue::Bool(true))?;
    let mut fd = Integrator::new(decay(), 0., 1., o)?;
    let fd_blocks = fd.jacobian(&[1.], &[1.], &requests)?;

    for (f, d) in fwd_blocks.iter().zip(&fd_blocks) {
        let (f, d) = (f.matrix().unwrap(), d.matrix().unwrap());
        assert_eq!(f.dim(), d.dim());
        assert_eq_tol!(f[(0, 0)], d[(0, 0)], 5e-3);
    }
    Ok(())
}

struct OpaqueDecay;

impl ResidualFn for OpaqueDecay {
    fn n_x(&self) -> usize { 1 }
    fn n_p(&self) -> usize { 1 }
    fn eval(&self, _t: f64, x: &[f64], _z: &[f64], _xdot: &[f64],
            p: &[f64], ode: &mut [f64], _alg: &mut [f64],
            _quad: &mut [f64]) {
        ode[0] = -p[0] * x[0];
    }
}

#[test]
fn opaque_callbacks_fall_back_to_finite_differences() -> Result<(), Error> {
    let mut ivp = Integrator::from_residual(Arc::new(OpaqueDecay),
                                            0., 1., opts())?;
    let blocks = ivp.jacobian(&[1.], &[1.], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
    ])?;
    let f = (-1f64).exp();
    assert_eq_tol!(blocks[0].matrix().unwrap()[(0, 0)], f, 5e-3);
    assert_eq_tol!(blocks[1].matrix().unwrap()[(0, 0)], -f, 5e-3);
    Ok(())
}

#[test]
fn quadrature_derivatives_need_quadratures() {
    let mut ivp = Integrator::new(decay(), 0., 1., opts()).unwrap();
    let err = ivp.jacobian(&[1.], &[1.], &[
        BlockRequest::new(OutputSel::FinalQuad, InputSel::Parameters),
    ]).unwrap_err();
    assert!(matches!(err, Error::InvalidBlockRequest(_)));
}

#[test]
fn repeated_queries_reuse_the_integrator() -> Result<(), Error> {
    let mut ivp = Integrator::new(decay(), 0., 1., opts())?;
    let req = [BlockRequest::new(OutputSel::FinalState,
                                 InputSel::InitialState)];
    let first = ivp.jacobian(&[1.], &[1.], &req)?;
    let second = ivp.jacobian(&[2.], &[1.], &req)?;
    // ∂x(T)/∂x₀ of a linear system does not depend on x₀.
    assert_eq_tol!(first[0].matrix().unwrap()[(0, 0)],
                   second[0].matrix().unwrap()[(0, 0)], 1e-5);
    Ok(())
}
