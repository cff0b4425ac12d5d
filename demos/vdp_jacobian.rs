//! Jacobians of the Van der Pol oscillator with respect to its initial
//! state and its damping parameter μ.

use daesens::{BlockRequest, DaeOutputs, DaeSystem, InputSel, Integrator,
              OptValue, Options, OutputSel, Schema};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ẋ₀ = x₁, ẋ₁ = μ(1 − x₀²)x₁ − x₀
    let dae = DaeSystem::explicit(2, 0, 1, |g, v| {
        let sq = g.mul(v.x[0], v.x[0]);
        let one = g.one();
        let damp = g.sub(one, sq);
        let md = g.mul(v.p[0], damp);
        let mdv = g.mul(md, v.x[1]);
        let acc = g.sub(mdv, v.x[0]);
        DaeOutputs { ode: vec![v.x[1], acc], alg: vec![], quad: vec![] }
    })?;
    let opts = Options::new(Schema::integrator())
        .with("reltol", OptValue::Real(1e-8))?
        .with("abstol", OptValue::Real(1e-10))?
        .with("max_num_steps", OptValue::Int(200_000))?
        .with("exact_jacobian", OptValue::Bool(true))?;
    let mut ivp = Integrator::new(dae, 0., 1., opts)?;
    let blocks = ivp.jacobian(&[2., 0.], &[2.], &[
        BlockRequest::new(OutputSel::FinalState, InputSel::None),
        BlockRequest::new(OutputSel::FinalState, InputSel::InitialState),
        BlockRequest::new(OutputSel::FinalState, InputSel::Parameters),
    ])?;

    let xf = blocks[0].value().ok_or("expected a value")?;
    println!("x(T)     = [{:.8}, {:.8}]", xf[0], xf[1]);
    let d_x0 = blocks[1].matrix().ok_or("expected a matrix")?;
    println!("dx(T)/dx0 =");
    for i in 0..2 {
        println!("  [{:12.8} {:12.8}]", d_x0[(i, 0)], d_x0[(i, 1)]);
    }
    let d_mu = blocks[2].matrix().ok_or("expected a matrix")?;
    println!("dx(T)/dμ  = [{:.8}, {:.8}]", d_mu[(0, 0)], d_mu[(1, 0)]);
    Ok(())
}
