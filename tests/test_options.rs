use std::collections::BTreeMap;
use daesens::{DaeOutputs, DaeSystem, Error, Integrator, OptValue, Options,
              Schema};
use daesens::linear_solver::DenseQr;

fn opts() -> Options {
    Options::new(Schema::integrator())
}

fn decay() -> DaeSystem {
    DaeSystem::explicit(1, 0, 1, |g, v| {
        let px = g.mul(v.p[0], v.x[0]);
        let rhs = g.neg(px);
        DaeOutputs { ode: vec![rhs], alg: vec![], quad: vec![] }
    }).unwrap()
}

#[test]
fn defaults_match_the_declarations() -> Result<(), Error> {
    let o = opts();
    assert_eq!(o.real("reltol")?, 1e-6);
    assert_eq!(o.real("abstol")?, 1e-8);
    assert_eq!(o.int("max_num_steps")?, 10_000);
    assert_eq!(o.int("max_multistep_order")?, 5);
    assert_eq!(o.string("linear_solver")?, "dense");
    assert_eq!(o.string("iterative_solver")?, "gmres");
    assert_eq!(o.string("pretype")?, "none");
    assert_eq!(o.int("max_krylov")?, 10);
    assert!(!o.boolean("exact_jacobian")?);
    assert!(o.boolean("fsens_err_con")?);
    assert!(!o.boolean("quad_err_con")?);
    assert_eq!(o.string("sensitivity_method")?, "simultaneous");
    assert_eq!(o.int("steps_per_checkpoint")?, 20);
    assert_eq!(o.string("interpolation_type")?, "hermite");
    Ok(())
}

#[test]
fn unknown_names_are_rejected() {
    let mut o = opts();
    let err = o.set("reltoll", OptValue::Real(1e-9)).unwrap_err();
    assert!(matches!(err, Error::UnknownOption { .. }));
    let err = o.real("reltoll").unwrap_err();
    assert!(matches!(err, Error::UnknownOption { .. }));
}

#[test]
fn wrong_types_are_rejected() {
    let err = opts().with("reltol", OptValue::Str("tight".into()))
        .unwrap_err();
    match err {
        Error::OptionTypeMismatch { name, expected, got } => {
            assert_eq!(name, "reltol");
            assert_eq!(expected, "real");
            assert_eq!(got, "string");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn integers_promote_to_reals() -> Result<(), Error> {
    let o = opts().with("abstol", OptValue::Int(1))?;
    assert_eq!(o.real("abstol")?, 1.);
    Ok(())
}

#[test]
fn enum_values_are_checked() {
    let err = opts().with("linear_solver", OptValue::Str("sparse".into()))
        .unwrap_err();
    match err {
        Error::InvalidEnumValue { name, value, allowed } => {
            assert_eq!(name, "linear_solver");
            assert_eq!(value, "sparse");
            assert!(allowed.contains("banded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn user_defined_is_not_a_backward_solver() {
    // The forward problem accepts an injected solver; the backward
    // configuration addresses a library-managed instance only.
    assert!(opts().with("linear_solver",
                        OptValue::Str("user_defined".into())).is_ok());
    let err = opts().with("asens_linear_solver",
                          OptValue::Str("user_defined".into())).unwrap_err();
    assert!(matches!(err, Error::InvalidEnumValue { .. }));
}

#[test]
fn sensitivity_tolerances_default_to_unset() -> Result<(), Error> {
    let o = opts();
    assert!(!o.has_set("fsens_reltol"));
    assert_eq!(o.real_opt("fsens_reltol")?, None);
    let o = o.with("fsens_reltol", OptValue::Real(2e-7))?;
    assert!(o.has_set("fsens_reltol"));
    assert_eq!(o.real_opt("fsens_reltol")?, Some(2e-7));
    Ok(())
}

#[test]
fn fd_sensitivity_tuning_keys_are_recorded() -> Result<(), Error> {
    let o = opts()
        .with("fsens_scaling_factors", OptValue::RealVec(vec![1., 0.5]))?
        .with("fsens_sensitiviy_parameters", OptValue::IntVec(vec![0]))?;
    assert!(o.has_set("fsens_scaling_factors"));
    assert!(o.has_set("fsens_sensitiviy_parameters"));
    let err = opts().with("fsens_scaling_factors",
                          OptValue::Real(2.)).unwrap_err();
    assert!(matches!(err, Error::OptionTypeMismatch { .. }));
    Ok(())
}

#[test]
fn construction_validates_option_values() {
    let bad = |o: Options| {
        let err = Integrator::new(decay(), 0., 1., o).unwrap_err();
        assert!(matches!(err, Error::InvalidOptionValue { .. }), "{err}");
    };
    bad(opts().with("reltol", OptValue::Real(-1.)).unwrap());
    bad(opts().with("abstol", OptValue::Real(0.)).unwrap());
    bad(opts().with("max_num_steps", OptValue::Int(0)).unwrap());
    bad(opts().with("max_multistep_order", OptValue::Int(9)).unwrap());
    bad(opts().with("lower_bandwidth", OptValue::Int(-2)).unwrap());
    // The banded backend needs both bandwidths.
    bad(opts()
        .with("linear_solver", OptValue::Str("banded".into())).unwrap()
        .with("lower_bandwidth", OptValue::Int(1)).unwrap());
}

#[test]
fn solver_options_dict_reaches_the_creator() -> Result<(), Error> {
    let mut dict = BTreeMap::new();
    dict.insert("max_nrhs".to_string(), OptValue::Int(4));
    let o = opts()
        .with("linear_solver", OptValue::Str("user_defined".into()))?
        .with("linear_solver_options", OptValue::Dict(dict))?;
    let mut ivp = Integrator::new(decay(), 0., 1., o)?;
    ivp.set_linear_solver_creator(Box::new(|_sp, dict| {
        let mut o = Options::new(Schema::dense_qr());
        if let Some(d) = dict {
            for (k, v) in d {
                o.set(k, v.clone())?;
            }
        }
        Ok(Box::new(DenseQr::with_options(&o)?))
    }));
    let out = ivp.solve(&[1.], &[1.])?;
    assert!((out.xf[0] - (-1f64).exp()).abs() < 1e-5);
    Ok(())
}

#[test]
fn injected_solver_instance_is_used() -> Result<(), Error> {
    let o = opts()
        .with("linear_solver", OptValue::Str("user_defined".into()))?;
    let mut ivp = Integrator::new(decay(), 0., 1., o)?;
    ivp.set_linear_solver(Box::new(DenseQr::new()));
    let out = ivp.solve(&[1.], &[1.])?;
    assert!((out.xf[0] - (-1f64).exp()).abs() < 1e-5);
    Ok(())
}

#[test]
fn options_are_kept_by_the_integrator() -> Result<(), Error> {
    let o = opts().with("max_num_steps", OptValue::Int(123))?;
    let ivp = Integrator::new(decay(), 0., 1., o)?;
    assert_eq!(ivp.options().int("max_num_steps")?, 123);
    Ok(())
}
