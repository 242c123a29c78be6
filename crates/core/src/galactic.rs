//! Galactic hyper-dual quaternions
//!
//! A `Galactic` carries a primal value `w` and three tangent channels
//! `x, y, z`. Multiplication follows the chain rule on each tangent, which
//! makes derivative tracking automatic: feed measurements through ordinary
//! arithmetic and the tangents stay consistent.
//!
//! Galactic values are first-class in Celestial IR and are not lowered
//! until code generation, so optimization passes can reason about the
//! derivative channels directly. The scheduler's predictor uses the same
//! type for per-strand execution statistics.

use crate::scalar::Scalar;

/// Hyper-dual number: primal plus three independent tangent channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Galactic {
    pub w: Scalar,
    pub x: Scalar,
    pub y: Scalar,
    pub z: Scalar,
}

impl Galactic {
    pub const ZERO: Galactic = Galactic {
        w: Scalar::ZERO,
        x: Scalar::ZERO,
        y: Scalar::ZERO,
        z: Scalar::ZERO,
    };

    /// All four components VOID.
    pub const VOID: Galactic = Galactic {
        w: Scalar::VOID,
        x: Scalar::VOID,
        y: Scalar::VOID,
        z: Scalar::VOID,
    };

    /// A constant: primal value, zero tangents.
    pub fn constant(w: Scalar) -> Galactic {
        Galactic {
            w,
            x: Scalar::ZERO,
            y: Scalar::ZERO,
            z: Scalar::ZERO,
        }
    }

    pub fn new(w: Scalar, x: Scalar, y: Scalar, z: Scalar) -> Galactic {
        Galactic { w, x, y, z }
    }

    /// VOID if any component is VOID.
    pub fn is_void(&self) -> bool {
        self.w.is_void() || self.x.is_void() || self.y.is_void() || self.z.is_void()
    }

    pub fn add(self, rhs: Galactic) -> Galactic {
        if self.is_void() || rhs.is_void() {
            return Galactic::VOID;
        }
        Galactic {
            w: self.w.add(rhs.w),
            x: self.x.add(rhs.x),
            y: self.y.add(rhs.y),
            z: self.z.add(rhs.z),
        }
    }

    pub fn sub(self, rhs: Galactic) -> Galactic {
        if self.is_void() || rhs.is_void() {
            return Galactic::VOID;
        }
        Galactic {
            w: self.w.sub(rhs.w),
            x: self.x.sub(rhs.x),
            y: self.y.sub(rhs.y),
            z: self.z.sub(rhs.z),
        }
    }

    /// Chain-rule product: `(a*b).x = a.w*b.x + a.x*b.w`, same for y and z.
    pub fn mul(self, rhs: Galactic) -> Galactic {
        if self.is_void() || rhs.is_void() {
            return Galactic::VOID;
        }
        Galactic {
            w: self.w.mul(rhs.w),
            x: self.w.mul(rhs.x).add(self.x.mul(rhs.w)),
            y: self.w.mul(rhs.y).add(self.y.mul(rhs.w)),
            z: self.w.mul(rhs.z).add(self.z.mul(rhs.w)),
        }
    }

    /// Quotient rule on each tangent. Division by a zero primal is VOID.
    pub fn div(self, rhs: Galactic) -> Galactic {
        if self.is_void() || rhs.is_void() {
            return Galactic::VOID;
        }
        let w = self.w.div(rhs.w);
        if w.is_void() {
            return Galactic::VOID;
        }
        let denom = rhs.w.mul(rhs.w);
        let tangent = |n: Scalar, d: Scalar| n.mul(rhs.w).sub(self.w.mul(d)).div(denom);
        Galactic {
            w,
            x: tangent(self.x, rhs.x),
            y: tangent(self.y, rhs.y),
            z: tangent(self.z, rhs.z),
        }
    }

    /// Scale every component by a scalar.
    pub fn scale(self, k: Scalar) -> Galactic {
        if self.is_void() || k.is_void() {
            return Galactic::VOID;
        }
        Galactic {
            w: self.w.mul(k),
            x: self.x.mul(k),
            y: self.y.mul(k),
            z: self.z.mul(k),
        }
    }

    /// First-order prediction along the x tangent: `w + x * dt`.
    pub fn predict(&self, dt: Scalar) -> Scalar {
        self.w.add(self.x.mul(dt))
    }

    /// Prediction across all three tangent channels, each with its own step.
    pub fn predict3(&self, dx: Scalar, dy: Scalar, dz: Scalar) -> Scalar {
        self.w
            .add(self.x.mul(dx))
            .add(self.y.mul(dy))
            .add(self.z.mul(dz))
    }

    /// Component by index: 0=w, 1=x, 2=y, 3=z. Out of range reads VOID.
    pub fn component(&self, idx: usize) -> Scalar {
        match idx {
            0 => self.w,
            1 => self.x,
            2 => self.y,
            3 => self.z,
            _ => Scalar::VOID,
        }
    }

    /// Replace a component by index, returning the updated value.
    pub fn with_component(mut self, idx: usize, v: Scalar) -> Galactic {
        match idx {
            0 => self.w = v,
            1 => self.x = v,
            2 => self.y = v,
            3 => self.z = v,
            _ => return Galactic::VOID,
        }
        self
    }
}

impl std::fmt::Display for Galactic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} | {} {} {})", self.w, self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(w: i64, x: i64, y: i64, z: i64) -> Galactic {
        Galactic::new(
            Scalar::from_int(w),
            Scalar::from_int(x),
            Scalar::from_int(y),
            Scalar::from_int(z),
        )
    }

    #[test]
    fn add_componentwise() {
        assert_eq!(g(1, 2, 3, 4).add(g(10, 20, 30, 40)), g(11, 22, 33, 44));
    }

    #[test]
    fn mul_chain_rule() {
        // (w=2, x=1) * (w=3, x=5): w = 6, x = 2*5 + 1*3 = 13
        let a = g(2, 1, 0, 0);
        let b = g(3, 5, 0, 0);
        let p = a.mul(b);
        assert_eq!(p.w, Scalar::from_int(6));
        assert_eq!(p.x, Scalar::from_int(13));
        assert_eq!(p.y, Scalar::ZERO);
    }

    #[test]
    fn mul_tangents_independent() {
        let a = g(2, 1, 10, 100);
        let b = g(3, 0, 0, 0);
        let p = a.mul(b);
        assert_eq!(p.x, Scalar::from_int(3));
        assert_eq!(p.y, Scalar::from_int(30));
        assert_eq!(p.z, Scalar::from_int(300));
    }

    #[test]
    fn predict_is_linear_in_dt() {
        let v = g(10, 2, 0, 0);
        assert_eq!(v.predict(Scalar::from_int(3)), Scalar::from_int(16));
        assert_eq!(v.predict(Scalar::ZERO), Scalar::from_int(10));
    }

    #[test]
    fn predict3_uses_all_channels() {
        let v = g(1, 2, 3, 4);
        let p = v.predict3(
            Scalar::from_int(1),
            Scalar::from_int(10),
            Scalar::from_int(100),
        );
        // 1 + 2*1 + 3*10 + 4*100 = 433
        assert_eq!(p, Scalar::from_int(433));
    }

    #[test]
    fn div_inverts_mul_on_primal() {
        let a = g(12, 4, 0, 0);
        let b = g(3, 0, 0, 0);
        let q = a.div(b);
        assert_eq!(q.w, Scalar::from_int(4));
        // d(a/b)/dx with db/dx = 0: x' = a.x / b.w = 4/3... in Q64.64
        assert_eq!(q.x, Scalar::from_int(4).div(Scalar::from_int(3)));
    }

    #[test]
    fn void_propagates() {
        let v = Galactic {
            w: Scalar::VOID,
            ..Galactic::ZERO
        };
        assert!(v.is_void());
        assert!(v.add(g(1, 1, 1, 1)).is_void());
        assert!(g(1, 0, 0, 0).mul(v).is_void());
        // Division by zero primal voids the whole value
        assert!(g(1, 0, 0, 0).div(Galactic::ZERO).is_void());
    }

    #[test]
    fn component_access() {
        let v = g(1, 2, 3, 4);
        assert_eq!(v.component(0), Scalar::from_int(1));
        assert_eq!(v.component(3), Scalar::from_int(4));
        assert!(v.component(4).is_void());
        assert_eq!(
            v.with_component(1, Scalar::from_int(9)).component(1),
            Scalar::from_int(9)
        );
    }
}
