//! Forward sensitivity equations.
//!
//! [`augment`] turns a DAE system into a larger one whose extra states
//! are the directional derivatives of the originals.  For every
//! requested direction d the builder seeds the inputs with fresh
//! symbolic vectors s_d (and a unit parameter entry for parameter
//! directions), pushes the seeds through the system's expressions in
//! forward mode, and appends the resulting derivative expressions to
//! the outputs.  Integrating the augmented system therefore integrates
//! the sensitivities alongside the solution: with s_d(t₀) = eᵢ the
//! block s_d(t_f) is a column of ∂x(t_f)/∂x₀, with s_d(t₀) = 0 and a
//! unit seed on parameter j it is a column of ∂x(t_f)/∂p.
//!
//! The layout is direction-major.  Augmented states are
//! `[x, s_0, …, s_{ns−1}]`; outputs follow the same pattern, base
//! block first.  State directions (ns_x of them) come before parameter
//! directions (ns_p).

use crate::{Error, Result};
use crate::dae::DaeSystem;
use crate::expr::{ExprGraph, ExprId};

/// Number of directions each enabled group contributes.
pub(crate) fn direction_counts(base: &DaeSystem, with_x: bool, with_p: bool)
                               -> (usize, usize) {
    let ns_x = if with_x { base.n_x() } else { 0 };
    let ns_p = if with_p { base.n_p() } else { 0 };
    (ns_x, ns_p)
}

/// Build the sensitivity-augmented counterpart of `base`.
///
/// With `with_x`, one direction per differential state is added; with
/// `with_p`, one per parameter.  The base system is only read; the
/// returned system owns a fresh arena.  Zero total directions fail
/// with [`Error::NoSensitivityRequested`].
pub fn augment(base: &DaeSystem, with_x: bool, with_p: bool)
               -> Result<DaeSystem> {
    let (n_x, n_z, n_p) = (base.n_x(), base.n_z(), base.n_p());
    let (ns_x, ns_p) = direction_counts(base, with_x, with_p);
    let ns = ns_x + ns_p;
    if ns == 0 {
        return Err(Error::NoSensitivityRequested)
    }
    let implicit = base.is_implicit();

    // Fresh arena; slot order must remain t, x…, z…, ẋ…, p.
    let mut g = ExprGraph::new();
    let t = g.var();
    let x0 = g.vars(n_x);
    let x_sens: Vec<Vec<ExprId>> = (0..ns).map(|_| g.vars(n_x)).collect();
    let z0 = g.vars(n_z);
    let z_sens: Vec<Vec<ExprId>> = (0..ns).map(|_| g.vars(n_z)).collect();
    let (xdot0, xdot_sens): (Vec<ExprId>, Vec<Vec<ExprId>>) = if implicit {
        (g.vars(n_x), (0..ns).map(|_| g.vars(n_x)).collect())
    } else {
        (Vec::new(), Vec::new())
    };
    let p = g.vars(n_p);

    // Copy the base outputs over, rebinding its variables to the base
    // block of the augmented inputs.  One shared visited map keeps
    // subexpressions shared across ode, alg and quad.
    let mut roots = Vec::with_capacity(n_x + n_z + base.n_q());
    roots.extend_from_slice(&base.ode);
    roots.extend_from_slice(&base.alg);
    roots.extend_from_slice(&base.quad);
    let n_xdot = if implicit { n_x } else { 0 };
    let copied = g.import(&base.graph, &roots, |slot| {
        let s = slot as usize;
        if s == 0 {
            t
        } else if s < 1 + n_x {
            x0[s - 1]
        } else if s < 1 + n_x + n_z {
            z0[s - 1 - n_x]
        } else if s < 1 + n_x + n_z + n_xdot {
            xdot0[s - 1 - n_x - n_z]
        } else {
            p[s - 1 - n_x - n_z - n_xdot]
        }
    });
    let (ode0, rest) = copied.split_at(n_x);
    let (alg0, quad0) = rest.split_at(n_z);

    let mut ode_aug = ode0.to_vec();
    let mut alg_aug = alg0.to_vec();
    let mut quad_aug = quad0.to_vec();

    let zero = g.zero();
    let one = g.one();
    let mut seeds = Vec::with_capacity(g.num_vars());
    for d in 0..ns {
        // Seed tuple of direction d: the fresh sensitivity vectors for
        // x, z and ẋ, a zero time seed, and a parameter seed that is
        // zero except for a unit entry in parameter directions.
        seeds.clear();
        seeds.push(zero);
        seeds.extend_from_slice(&x_sens[d]);
        seeds.resize(seeds.len() + ns * n_x, zero);
        seeds.extend_from_slice(&z_sens[d]);
        seeds.resize(seeds.len() + ns * n_z, zero);
        if implicit {
            seeds.extend_from_slice(&xdot_sens[d]);
            seeds.resize(seeds.len() + ns * n_x, zero);
        }
        for j in 0..n_p {
            seeds.push(if d >= ns_x && j == d - ns_x { one } else { zero });
        }
        debug_assert_eq!(seeds.len(), g.num_vars());

        let der = g.fwd(&copied, &seeds);
        let (dode, drest) = der.split_at(n_x);
        let (dalg, dquad) = drest.split_at(n_z);
        ode_aug.extend_from_slice(dode);
        alg_aug.extend_from_slice(dalg);
        quad_aug.extend_from_slice(dquad);
    }

    let mut x_aug = x0;
    for s in x_sens {
        x_aug.extend(s);
    }
    let mut z_aug = z0;
    for s in z_sens {
        z_aug.extend(s);
    }
    let mut xdot_aug = xdot0;
    for s in xdot_sens {
        xdot_aug.extend(s);
    }

    DaeSystem::from_parts(g, t, x_aug, z_aug, xdot_aug, p,
                          ode_aug, alg_aug, quad_aug)
}
