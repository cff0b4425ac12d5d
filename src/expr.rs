//! Arena of scalar expressions with forward-mode differentiation.
//!
//! Expressions are nodes in an [`ExprGraph`], addressed by [`ExprId`]
//! (a plain index, cheap to copy and store).  Children are always
//! created before their parents, so a single pass over the arena in
//! index order visits every node after its operands.  Evaluation,
//! differentiation and cross-graph copies all exploit this ordering
//! and never recurse.

use std::fmt::{self, Debug, Formatter};

/// Index of a node in an [`ExprGraph`].
///
/// Ids are only meaningful for the graph that created them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

impl ExprId {
    #[inline]
    fn idx(self) -> usize { self.0 as usize }
}

impl Debug for ExprId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unary operations on scalar expressions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOp { Neg, Sin, Cos, Exp, Ln, Sqrt }

/// Binary operations on scalar expressions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp { Add, Sub, Mul, Div, Pow }

#[derive(Clone, Copy, Debug)]
enum Node {
    Const(f64),
    /// Free variable reading `values[slot]` at evaluation time.
    Var { slot: u32 },
    Un(UnOp, ExprId),
    Bin(BinOp, ExprId, ExprId),
}

/// Append-only arena of scalar expression nodes.
#[derive(Clone, Debug)]
pub struct ExprGraph {
    nodes: Vec<Node>,
    n_vars: u32,
    zero: ExprId,
    one: ExprId,
}

impl Default for ExprGraph {
    fn default() -> Self { Self::new() }
}

impl ExprGraph {
    pub fn new() -> Self {
        let mut g = ExprGraph {
            nodes: Vec::new(),
            n_vars: 0,
            zero: ExprId(0),
            one: ExprId(0),
        };
        g.zero = g.push(Node::Const(0.));
        g.one = g.push(Node::Const(1.));
        g
    }

    /// Number of nodes in the arena.
    pub fn num_nodes(&self) -> usize { self.nodes.len() }

    /// Number of variable slots handed out so far.  Evaluation and
    /// seeding take slices of exactly this length.
    pub fn num_vars(&self) -> usize { self.n_vars as usize }

    #[inline]
    fn push(&mut self, n: Node) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(n);
        id
    }

    /// Allocate a fresh variable.  Slots are assigned in creation order.
    pub fn var(&mut self) -> ExprId {
        let slot = self.n_vars;
        self.n_vars += 1;
        self.push(Node::Var { slot })
    }

    /// Allocate `n` fresh variables.
    pub fn vars(&mut self, n: usize) -> Vec<ExprId> {
        (0..n).map(|_| self.var()).collect()
    }

    pub fn constant(&mut self, v: f64) -> ExprId {
        if v == 0. { return self.zero }
        if v == 1. { return self.one }
        self.push(Node::Const(v))
    }

    /// The shared constant 0.
    pub fn zero(&self) -> ExprId { self.zero }

    /// The shared constant 1.
    pub fn one(&self) -> ExprId { self.one }

    fn const_value(&self, id: ExprId) -> Option<f64> {
        match self.nodes[id.idx()] {
            Node::Const(v) => Some(v),
            _ => None,
        }
    }

    /// True if `id` is the literal constant 0.
    pub fn is_zero(&self, id: ExprId) -> bool {
        self.const_value(id) == Some(0.)
    }

    /// Variable slot of `id`, if it is a variable.
    pub fn var_slot(&self, id: ExprId) -> Option<u32> {
        match self.nodes[id.idx()] {
            Node::Var { slot } => Some(slot),
            _ => None,
        }
    }

    /// True if every id indexes a node of this graph.
    pub fn contains_all(&self, ids: &[ExprId]) -> bool {
        ids.iter().all(|id| id.idx() < self.nodes.len())
    }

    ////////////////////////////////////////////////////////////////////
    //
    // Constructors (with light constant folding)

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => self.constant(x + y),
            (Some(0.), _) => b,
            (_, Some(0.)) => a,
            _ => self.push(Node::Bin(BinOp::Add, a, b)),
        }
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == b { return self.zero }
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => self.constant(x - y),
            (_, Some(0.)) => a,
            (Some(0.), _) => self.neg(b),
            _ => self.push(Node::Bin(BinOp::Sub, a, b)),
        }
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => self.constant(x * y),
            (Some(0.), _) | (_, Some(0.)) => self.zero,
            (Some(1.), _) => b,
            (_, Some(1.)) => a,
            _ => self.push(Node::Bin(BinOp::Mul, a, b)),
        }
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => self.constant(x / y),
            (Some(0.), _) => self.zero,
            (_, Some(1.)) => a,
            _ => self.push(Node::Bin(BinOp::Div, a, b)),
        }
    }

    pub fn pow(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => self.constant(x.powf(y)),
            (_, Some(1.)) => a,
            (_, Some(0.)) => self.one,
            _ => self.push(Node::Bin(BinOp::Pow, a, b)),
        }
    }

    /// `a` raised to the constant power `p`.
    pub fn powf(&mut self, a: ExprId, p: f64) -> ExprId {
        let b = self.constant(p);
        self.pow(a, b)
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) { return self.constant(-x) }
        if let Node::Un(UnOp::Neg, inner) = self.nodes[a.idx()] {
            return inner
        }
        self.push(Node::Un(UnOp::Neg, a))
    }

    pub fn sin(&mut self, a: ExprId) -> ExprId { self.unary(UnOp::Sin, a) }
    pub fn cos(&mut self, a: ExprId) -> ExprId { self.unary(UnOp::Cos, a) }
    pub fn exp(&mut self, a: ExprId) -> ExprId { self.unary(UnOp::Exp, a) }
    pub fn ln(&mut self, a: ExprId) -> ExprId { self.unary(UnOp::Ln, a) }
    pub fn sqrt(&mut self, a: ExprId) -> ExprId { self.unary(UnOp::Sqrt, a) }

    fn unary(&mut self, op: UnOp, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) {
            let v = match op {
                UnOp::Neg => -x,
                UnOp::Sin => x.sin(),
                UnOp::Cos => x.cos(),
                UnOp::Exp => x.exp(),
                UnOp::Ln => x.ln(),
                UnOp::Sqrt => x.sqrt(),
            };
            return self.constant(v)
        }
        self.push(Node::Un(op, a))
    }

    /// Linear combination `Σ cᵢ·xᵢ` over (coefficient, expression) pairs.
    pub fn lincomb(&mut self, terms: &[(f64, ExprId)]) -> ExprId {
        let mut acc = self.zero;
        for &(c, x) in terms {
            let cx = if c == 1. { x } else {
                let c = self.constant(c);
                self.mul(c, x)
            };
            acc = self.add(acc, cx);
        }
        acc
    }

    ////////////////////////////////////////////////////////////////////
    //
    // Evaluation

    /// Evaluate `roots` with variable slot `i` bound to `values[i]`,
    /// writing one result per root into `out`.  `work` is a scratch
    /// buffer reused across calls; it is resized as needed.
    ///
    /// Panics if `values` is shorter than [`Self::num_vars`] or if
    /// `out.len() != roots.len()`.
    pub fn eval_into(&self, roots: &[ExprId], values: &[f64],
                     out: &mut [f64], work: &mut Vec<f64>) {
        assert!(values.len() >= self.num_vars());
        assert_eq!(out.len(), roots.len());
        work.resize(self.nodes.len(), 0.);
        for (i, node) in self.nodes.iter().enumerate() {
            work[i] = match *node {
                Node::Const(v) => v,
                Node::Var { slot } => values[slot as usize],
                Node::Un(op, a) => {
                    let x = work[a.idx()];
                    match op {
                        UnOp::Neg => -x,
                        UnOp::Sin => x.sin(),
                        UnOp::Cos => x.cos(),
                        UnOp::Exp => x.exp(),
                        UnOp::Ln => x.ln(),
                        UnOp::Sqrt => x.sqrt(),
                    }
                }
                Node::Bin(op, a, b) => {
                    let x = work[a.idx()];
                    let y = work[b.idx()];
                    match op {
                        BinOp::Add => x + y,
                        BinOp::Sub => x - y,
                        BinOp::Mul => x * y,
                        BinOp::Div => x / y,
                        BinOp::Pow => x.powf(y),
                    }
                }
            };
        }
        for (o, r) in out.iter_mut().zip(roots) {
            *o = work[r.idx()];
        }
    }

    /// Evaluate `roots`, allocating the result.
    pub fn eval(&self, roots: &[ExprId], values: &[f64]) -> Vec<f64> {
        let mut out = vec![0.; roots.len()];
        let mut work = Vec::new();
        self.eval_into(roots, values, &mut out, &mut work);
        out
    }

    ////////////////////////////////////////////////////////////////////
    //
    // Forward-mode differentiation

    /// Symbolic directional derivative of `roots`: variable slot `i`
    /// carries the seed expression `seeds[i]`.  Shared subexpressions
    /// are differentiated once, so the derivative of a diamond stays a
    /// diamond.
    ///
    /// Panics if `seeds.len() != num_vars()`.
    pub fn fwd(&mut self, roots: &[ExprId], seeds: &[ExprId]) -> Vec<ExprId> {
        assert_eq!(seeds.len(), self.num_vars());
        let n = self.nodes.len();
        // Restrict the sweep to nodes reachable from `roots`; without
        // this, repeated calls on a growing arena would also
        // differentiate the derivatives of earlier calls.
        let mut needed = vec![false; n];
        for r in roots {
            needed[r.idx()] = true;
        }
        for i in (0..n).rev() {
            if !needed[i] { continue }
            match self.nodes[i] {
                Node::Const(_) | Node::Var { .. } => {}
                Node::Un(_, a) => needed[a.idx()] = true,
                Node::Bin(_, a, b) => {
                    needed[a.idx()] = true;
                    needed[b.idx()] = true;
                }
            }
        }
        let mut der: Vec<ExprId> = vec![self.zero; n];
        for i in 0..n {
            if !needed[i] { continue }
            der[i] = match self.nodes[i] {
                Node::Const(_) => self.zero,
                Node::Var { slot } => seeds[slot as usize],
                Node::Un(op, a) => {
                    let da = der[a.idx()];
                    match op {
                        UnOp::Neg => self.neg(da),
                        // (sin a)' = cos(a)·a'
                        UnOp::Sin => {
                            let c = self.cos(a);
                            self.mul(c, da)
                        }
                        UnOp::Cos => {
                            let s = self.sin(a);
                            let ms = self.neg(s);
                            self.mul(ms, da)
                        }
                        UnOp::Exp => {
                            let e = self.exp(a);
                            self.mul(e, da)
                        }
                        UnOp::Ln => self.div(da, a),
                        // (√a)' = a' / (2√a)
                        UnOp::Sqrt => {
                            let s = self.sqrt(a);
                            let two = self.constant(2.);
                            let d = self.mul(two, s);
                            self.div(da, d)
                        }
                    }
                }
                Node::Bin(op, a, b) => {
                    let da = der[a.idx()];
                    let db = der[b.idx()];
                    match op {
                        BinOp::Add => self.add(da, db),
                        BinOp::Sub => self.sub(da, db),
                        BinOp::Mul => {
                            let l = self.mul(da, b);
                            let r = self.mul(a, db);
                            self.add(l, r)
                        }
                        // (a/b)' = (a'·b − a·b')/b²
                        BinOp::Div => {
                            let l = self.mul(da, b);
                            let r = self.mul(a, db);
                            let num = self.sub(l, r);
                            let den = self.mul(b, b);
                            self.div(num, den)
                        }
                        BinOp::Pow => self.pow_derivative(a, b, da, db),
                    }
                }
            };
        }
        roots.iter().map(|r| der[r.idx()]).collect()
    }

    fn pow_derivative(&mut self, a: ExprId, b: ExprId,
                      da: ExprId, db: ExprId) -> ExprId {
        if let Some(p) = self.const_value(b) {
            // (aᵖ)' = p·aᵖ⁻¹·a'
            let e = self.constant(p - 1.);
            let ap = self.pow(a, e);
            let p = self.constant(p);
            let c = self.mul(p, ap);
            return self.mul(c, da)
        }
        // (a^b)' = a^b·(b'·ln a + b·a'/a)
        let ab = self.pow(a, b);
        let la = self.ln(a);
        let t1 = self.mul(db, la);
        let q = self.div(da, a);
        let t2 = self.mul(b, q);
        let s = self.add(t1, t2);
        self.mul(ab, s)
    }

    ////////////////////////////////////////////////////////////////////
    //
    // Cross-graph copies

    /// Deep-copy the expressions `roots` of `src` into this graph.
    /// Each source node is translated exactly once; the map of nodes
    /// already visited is kept per call, so sharing in `src` is
    /// preserved in the copy.  Source variables are translated through
    /// `map_var`, called with the source slot.
    pub fn import(&mut self, src: &ExprGraph, roots: &[ExprId],
                  mut map_var: impl FnMut(u32) -> ExprId) -> Vec<ExprId> {
        let n = src.nodes.len();
        let mut needed = vec![false; n];
        for r in roots {
            needed[r.idx()] = true;
        }
        for i in (0..n).rev() {
            if !needed[i] { continue }
            match src.nodes[i] {
                Node::Const(_) | Node::Var { .. } => {}
                Node::Un(_, a) => needed[a.idx()] = true,
                Node::Bin(_, a, b) => {
                    needed[a.idx()] = true;
                    needed[b.idx()] = true;
                }
            }
        }
        let mut visited: Vec<ExprId> = vec![self.zero; n];
        for i in 0..n {
            if !needed[i] { continue }
            visited[i] = match src.nodes[i] {
                Node::Const(v) => self.constant(v),
                Node::Var { slot } => map_var(slot),
                Node::Un(op, a) => {
                    let a = visited[a.idx()];
                    self.unary(op, a)
                }
                Node::Bin(op, a, b) => {
                    let a = visited[a.idx()];
                    let b = visited[b.idx()];
                    match op {
                        BinOp::Add => self.add(a, b),
                        BinOp::Sub => self.sub(a, b),
                        BinOp::Mul => self.mul(a, b),
                        BinOp::Div => self.div(a, b),
                        BinOp::Pow => self.pow(a, b),
                    }
                }
            };
        }
        roots.iter().map(|r| visited[r.idx()]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ExprGraph;

    #[test]
    fn eval_composite() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let y = g.var();
        // sin(x)·y + x²
        let sx = g.sin(x);
        let sxy = g.mul(sx, y);
        let x2 = g.powf(x, 2.);
        let f = g.add(sxy, x2);
        let v = g.eval(&[f], &[0.7, 2.]);
        assert_eq_tol!(v[0], 0.7f64.sin() * 2. + 0.49, 1e-15);
    }

    #[test]
    fn constant_folding() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let z = g.zero();
        assert_eq!(g.add(x, z), x);
        assert_eq!(g.mul(x, z), z);
        let o = g.one();
        assert_eq!(g.mul(o, x), x);
        assert_eq!(g.sub(x, x), z);
        let a = g.constant(3.);
        let b = g.constant(4.);
        let c = g.add(a, b);
        assert_eq!(g.eval(&[c], &[0.])[0], 7.);
    }

    #[test]
    fn fwd_product_rule() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let y = g.var();
        let f = g.mul(x, y);
        // Seed x with 1, y with 0: ∂f/∂x = y.
        let one = g.one();
        let zero = g.zero();
        let df = g.fwd(&[f], &[one, zero]);
        let v = g.eval(&df, &[3., 5.]);
        assert_eq!(v[0], 5.);
    }

    #[test]
    fn fwd_chain_rule() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let sx = g.sin(x);
        let f = g.exp(sx);
        let one = g.one();
        let df = g.fwd(&[f], &[one]);
        let t = 0.3;
        let v = g.eval(&df, &[t]);
        assert_eq_tol!(v[0], t.sin().exp() * t.cos(), 1e-14);
    }

    #[test]
    fn fwd_shares_diamonds() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let s = g.sin(x);
        // s used twice: f = s·s.
        let f = g.mul(s, s);
        let before = g.num_nodes();
        let one = g.one();
        let _ = g.fwd(&[f], &[one]);
        // One cos(x) node and one product-rule combination; a naive
        // tree walk would duplicate the cos(x) branch.
        let added = g.num_nodes() - before;
        assert!(added <= 4, "derivative added {added} nodes");
    }

    #[test]
    fn fwd_directional_seed() {
        let mut g = ExprGraph::new();
        let x = g.var();
        let y = g.var();
        let f = g.mul(x, y);
        // Direction (2, −1): df = 2y − x.
        let two = g.constant(2.);
        let mone = g.constant(-1.);
        let df = g.fwd(&[f], &[two, mone]);
        let v = g.eval(&df, &[3., 5.]);
        assert_eq!(v[0], 2. * 5. - 3.);
    }

    #[test]
    fn import_remaps_variables() {
        let mut src = ExprGraph::new();
        let x = src.var();
        let c = src.constant(2.);
        let xc = src.mul(x, c);
        let f = src.sin(xc);

        let mut dst = ExprGraph::new();
        let u = dst.var();
        let v = dst.var();
        // Map the single source variable onto u+v.
        let uv = dst.add(u, v);
        let copied = dst.import(&src, &[f], |_slot| uv);
        let got = dst.eval(&copied, &[0.25, 0.15]);
        assert_eq_tol!(got[0], (0.4f64 * 2.).sin(), 1e-15);
    }

    #[test]
    fn import_preserves_sharing() {
        let mut src = ExprGraph::new();
        let x = src.var();
        let s = src.sin(x);
        let f = src.mul(s, s);

        let mut dst = ExprGraph::new();
        let u = dst.var();
        let before = dst.num_nodes();
        let _ = dst.import(&src, &[f], |_| u);
        // sin node copied once, product once.
        assert_eq!(dst.num_nodes() - before, 2);
    }
}
