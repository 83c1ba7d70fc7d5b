// コストは Scalar について一度だけ書く
// f64 ならその場で評価し、Expr なら式グラフを記録して Tape で命令列に落とす

use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use num::Signed;
use num_dual::{Dual64, DualNum};
use rayon::prelude::*;

pub trait Scalar:
    Clone
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn cst(v: f64) -> Self;
    fn sin(&self) -> Self;
    fn cos(&self) -> Self;
    fn powi(&self, n: i32) -> Self;
    fn abs(&self) -> Self;

    fn zero() -> Self {
        Self::cst(0.0)
    }
}

impl Scalar for f64 {
    fn cst(v: f64) -> Self {
        v
    }
    fn sin(&self) -> Self {
        f64::sin(*self)
    }
    fn cos(&self) -> Self {
        f64::cos(*self)
    }
    fn powi(&self, n: i32) -> Self {
        f64::powi(*self, n)
    }
    fn abs(&self) -> Self {
        if *self < 0.0 {
            -*self
        } else {
            *self
        }
    }
}

#[derive(Debug)]
enum Node {
    Var(usize),
    Const(f64),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Neg(Expr),
    Sin(Expr),
    Cos(Expr),
    Powi(Expr, i32),
    Abs(Expr),
}

/// 記号式のノード (共有部分式は Rc で共有)
#[derive(Debug, Clone)]
pub struct Expr(Rc<Node>);

impl Expr {
    pub fn var(index: usize) -> Self {
        Expr(Rc::new(Node::Var(index)))
    }

    /// 決定変数のプレースホルダを n 個作る
    pub fn vars(n: usize) -> Vec<Self> {
        (0..n).map(Expr::var).collect()
    }

    pub fn as_const(&self) -> Option<f64> {
        match *self.0 {
            Node::Const(v) => Some(v),
            _ => None,
        }
    }

    fn binary(a: Expr, b: Expr, fold: fn(f64, f64) -> f64, make: fn(Expr, Expr) -> Node) -> Self {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::cst(fold(x, y)),
            _ => Expr(Rc::new(make(a, b))),
        }
    }

    fn unary(a: Expr, fold: fn(f64) -> f64, make: fn(Expr) -> Node) -> Self {
        match a.as_const() {
            Some(x) => Expr::cst(fold(x)),
            None => Expr(Rc::new(make(a))),
        }
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(self, rhs, |x, y| x + y, Node::Add)
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(self, rhs, |x, y| x - y, Node::Sub)
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(self, rhs, |x, y| x * y, Node::Mul)
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(self, rhs, |x, y| x / y, Node::Div)
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(self, |x| -x, Node::Neg)
    }
}

impl Scalar for Expr {
    fn cst(v: f64) -> Self {
        Expr(Rc::new(Node::Const(v)))
    }
    fn sin(&self) -> Self {
        Expr::unary(self.clone(), f64::sin, Node::Sin)
    }
    fn cos(&self) -> Self {
        Expr::unary(self.clone(), f64::cos, Node::Cos)
    }
    fn powi(&self, n: i32) -> Self {
        match self.as_const() {
            Some(x) => Expr::cst(x.powi(n)),
            None => Expr(Rc::new(Node::Powi(self.clone(), n))),
        }
    }
    fn abs(&self) -> Self {
        Expr::unary(self.clone(), |x| if x < 0.0 { -x } else { x }, Node::Abs)
    }
}

#[derive(Debug, Clone, Copy)]
enum Instr {
    Var(usize),
    Const(f64),
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    Sin(usize),
    Cos(usize),
    Powi(usize, i32),
    Abs(usize),
}

/// 式グラフを一度だけ線形化した命令列
#[derive(Debug, Clone)]
pub struct Tape {
    instrs: Vec<Instr>,
    n_vars: usize,
}

impl Tape {
    pub fn compile(root: &Expr, n_vars: usize) -> Self {
        let mut instrs = Vec::new();
        let mut slots = HashMap::new();
        Self::emit(root, &mut instrs, &mut slots);
        Self { instrs, n_vars }
    }

    fn emit(e: &Expr, instrs: &mut Vec<Instr>, slots: &mut HashMap<*const Node, usize>) -> usize {
        let key = Rc::as_ptr(&e.0);
        if let Some(&slot) = slots.get(&key) {
            return slot;
        }
        let instr = match &*e.0 {
            Node::Var(i) => Instr::Var(*i),
            Node::Const(v) => Instr::Const(*v),
            Node::Add(a, b) => Instr::Add(Self::emit(a, instrs, slots), Self::emit(b, instrs, slots)),
            Node::Sub(a, b) => Instr::Sub(Self::emit(a, instrs, slots), Self::emit(b, instrs, slots)),
            Node::Mul(a, b) => Instr::Mul(Self::emit(a, instrs, slots), Self::emit(b, instrs, slots)),
            Node::Div(a, b) => Instr::Div(Self::emit(a, instrs, slots), Self::emit(b, instrs, slots)),
            Node::Neg(a) => Instr::Neg(Self::emit(a, instrs, slots)),
            Node::Sin(a) => Instr::Sin(Self::emit(a, instrs, slots)),
            Node::Cos(a) => Instr::Cos(Self::emit(a, instrs, slots)),
            Node::Powi(a, n) => Instr::Powi(Self::emit(a, instrs, slots), *n),
            Node::Abs(a) => Instr::Abs(Self::emit(a, instrs, slots)),
        };
        instrs.push(instr);
        let slot = instrs.len() - 1;
        slots.insert(key, slot);
        slot
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn eval<T: DualNum<f64> + From<f64> + Copy>(&self, x: &[T]) -> T {
        let mut v: Vec<T> = Vec::with_capacity(self.instrs.len());
        for instr in &self.instrs {
            let out = match *instr {
                Instr::Var(i) => x[i],
                Instr::Const(c) => T::from(c),
                Instr::Add(a, b) => v[a] + v[b],
                Instr::Sub(a, b) => v[a] - v[b],
                Instr::Mul(a, b) => v[a] * v[b],
                Instr::Div(a, b) => v[a] / v[b],
                Instr::Neg(a) => -v[a],
                Instr::Sin(a) => v[a].sin(),
                Instr::Cos(a) => v[a].cos(),
                Instr::Powi(a, n) => v[a].powi(n),
                Instr::Abs(a) => Signed::abs(&v[a]),
            };
            v.push(out);
        }
        v.last().copied().unwrap_or_else(|| T::from(0.0))
    }

    /// 前進モード二重数で勾配を求める (成分ごとに並列)
    pub fn gradient(&self, x: &[f64], grad: &mut [f64]) {
        let base: Vec<Dual64> = x.iter().map(|&e| Dual64::from(e)).collect();
        grad.par_iter_mut().enumerate().for_each(|(i, g)| {
            let mut seeded = base.clone();
            seeded[i].eps = 1.0;
            *g = self.eval(&seeded).eps;
        });
    }
}

// ---- 配列演算 (両バックエンド共通) ----

pub fn lift<S: Scalar>(x: &[f64]) -> Vec<S> {
    x.iter().map(|&e| S::cst(e)).collect()
}

pub fn sum<S: Scalar>(x: &[S]) -> S {
    let mut it = x.iter().cloned();
    match it.next() {
        Some(first) => it.fold(first, |acc, e| acc + e),
        None => S::zero(),
    }
}

pub fn dot<S: Scalar>(a: &[S], b: &[S]) -> S {
    let prods: Vec<S> = a.iter().zip(b).map(|(x, y)| x.clone() * y.clone()).collect();
    sum(&prods)
}

/// xᵀ diag(w) x
pub fn quad_diag<S: Scalar>(x: &[S], w: &[f64]) -> S {
    let terms: Vec<S> = x
        .iter()
        .zip(w)
        .filter(|(_, w)| **w != 0.0)
        .map(|(e, &w)| S::cst(w) * e.clone() * e.clone())
        .collect();
    sum(&terms)
}

pub fn sub_const<S: Scalar>(x: &[S], c: &[f64]) -> Vec<S> {
    x.iter().zip(c).map(|(e, &c)| e.clone() - S::cst(c)).collect()
}

pub fn vstack<S: Scalar>(a: &[S], b: &[S]) -> Vec<S> {
    a.iter().chain(b).cloned().collect()
}

/// 行優先で rows x cols に並べ替える
pub fn reshape<S: Scalar>(flat: &[S], rows: usize, cols: usize) -> Vec<Vec<S>> {
    assert_eq!(flat.len(), rows * cols, "reshape: size mismatch");
    flat.chunks(cols).map(|c| c.to_vec()).collect()
}

pub fn mat_vec<S: Scalar>(m: &na::DMatrix<f64>, x: &[S]) -> Vec<S> {
    (0..m.nrows())
        .map(|i| {
            let row: Vec<S> = (0..m.ncols())
                .filter(|&j| m[(i, j)] != 0.0)
                .map(|j| S::cst(m[(i, j)]) * x[j].clone())
                .collect();
            sum(&row)
        })
        .collect()
}

/// xxᵀ の上三角成分 (対角を含む)
pub fn outer_uptria<S: Scalar>(x: &[S]) -> Vec<S> {
    let n = x.len();
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for i in 0..n {
        for j in i..n {
            out.push(x[i].clone() * x[j].clone());
        }
    }
    out
}

pub fn kron<S: Scalar>(a: &[S], b: &[S]) -> Vec<S> {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| x.clone() * y.clone()))
        .collect()
}

pub fn square<S: Scalar>(x: &[S]) -> Vec<S> {
    x.iter().map(|e| e.clone() * e.clone()).collect()
}

/// 先頭の行を捨てて末尾に追加する
pub fn push_vec<S: Clone>(rows: &mut Vec<Vec<S>>, v: Vec<S>) {
    if !rows.is_empty() {
        rows.remove(0);
    }
    rows.push(v);
}
