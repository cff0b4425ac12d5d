//! Exponential decay with a work quadrature: every Jacobian entry is
//! known in closed form, so the output doubles as a sanity check.

use daesens::{BlockRequest, DaeOutputs, DaeSystem, InputSel, Integrator,
              OptValue, Options, OutputSel, Schema};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ẋ = −p·x, q̇ = x
    let dae = DaeSystem::explicit(1, 0, 1, |g, v| {
        let px = g.mul(v.p[0], v.x[0]);
        DaeOutputs { ode: vec![g.neg(px)], alg: vec![], quad: vec![v.x[0]] }
    })?;
    let (x0, p, tf) = (1.5, 0.8, 2.);
    let opts = Options::new(Schema::integrator())
        .with("reltol", OptValue::Real(1e-8))?
        .with("abstol", OptValue::Real(1e-10))?
        .with("max_num_steps", OptValue::Int(200_000))?;
    let mut ivp = Integrator::new(dae, 0., tf, opts)?;
    let blocks = ivp.jacobian(&[x0], &[p], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::None),
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
        BlockRequest::new(OutputSel::FinalQuad, InputSel::InitialState),
    ])?;

    let f = (-p * tf).exp();
    let xf = blocks[0].value().ok_or("expected a value")?;
    println!("x(T)       = {:.8}  (exact {:.8})", xf[0], x0 * f);
    let d_x0 = blocks[1].matrix().ok_or("expected a matrix")?;
    println!("dx(T)/dx0  = {:.8}  (exact {:.8})", d_x0[(0, 0)], f);
    let d_p = blocks[2].matrix().ok_or("expected a matrix")?;
    println!("dx(T)/dp   = {:.8}  (exact {:.8})", d_p[(0, 0)], -tf * x0 * f);
    let dq_x0 = blocks[3].matrix().ok_or("expected a matrix")?;
    println!("dq(T)/dx0  = {:.8}  (exact {:.8})", dq_x0[(0, 0)], (1. - f) / p);
    Ok(())
}
