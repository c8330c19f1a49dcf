//! Compile-time constants.
//!
//! Untyped constant arithmetic is exact: integers are arbitrary-precision
//! and floats are arbitrary-precision rationals. A constant carries its
//! default kind; materializing it into a typed location goes through the
//! representability check.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::ast::{BinOp, UnOp};
use crate::types::{self, IntKind, Type, TypeId, TypeRegistry};

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Bool(bool),
    Str(String),
    Int(BigInt),
    /// Same representation as `Int`, but the default type is `rune`.
    Rune(BigInt),
    Float(BigRational),
    Complex(BigRational, BigRational),
}

impl Constant {
    /// The default type a constant assumes in an untyped context.
    pub fn default_type(&self) -> TypeId {
        match self {
            Constant::Bool(_) => types::BOOL,
            Constant::Str(_) => types::STRING,
            Constant::Int(_) => types::INT,
            Constant::Rune(_) => types::RUNE,
            Constant::Float(_) => types::FLOAT64,
            Constant::Complex(..) => types::COMPLEX128,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Constant::Int(_) | Constant::Rune(_) | Constant::Float(_) | Constant::Complex(..)
        )
    }

    /// Numeric promotion rank: int < rune < float < complex.
    fn rank(&self) -> u8 {
        match self {
            Constant::Int(_) => 0,
            Constant::Rune(_) => 1,
            Constant::Float(_) => 2,
            Constant::Complex(..) => 3,
            _ => 4,
        }
    }

    fn as_rational(&self) -> Option<BigRational> {
        match self {
            Constant::Int(i) | Constant::Rune(i) => Some(BigRational::from_integer(i.clone())),
            Constant::Float(r) => Some(r.clone()),
            _ => None,
        }
    }

    fn as_complex(&self) -> Option<(BigRational, BigRational)> {
        match self {
            Constant::Complex(re, im) => Some((re.clone(), im.clone())),
            other => other.as_rational().map(|r| (r, BigRational::zero())),
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Constant::Bool(true))
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Constant::Int(i) | Constant::Rune(i) => i.to_i64(),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Constant::Int(i) | Constant::Rune(i) => i.to_f64(),
            Constant::Float(r) => rational_to_f64(r),
            _ => None,
        }
    }

    pub fn to_complex_f64(&self) -> Option<(f64, f64)> {
        let (re, im) = self.as_complex()?;
        Some((rational_to_f64(&re)?, rational_to_f64(&im)?))
    }
}

fn rational_to_f64(r: &BigRational) -> Option<f64> {
    let n = r.numer().to_f64()?;
    let d = r.denom().to_f64()?;
    Some(n / d)
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Int(i) | Constant::Rune(i) => write!(f, "{i}"),
            Constant::Float(r) => {
                if r.is_integer() {
                    write!(f, "{}", r.numer())
                } else {
                    write!(f, "{}", rational_to_f64(r).unwrap_or(f64::NAN))
                }
            }
            Constant::Complex(re, im) => {
                write!(
                    f,
                    "({}{:+}i)",
                    rational_to_f64(re).unwrap_or(f64::NAN),
                    rational_to_f64(im).unwrap_or(f64::NAN)
                )
            }
        }
    }
}

/// Parses an integer literal lexeme (decimal, hex, octal, binary, with
/// optional underscores).
pub fn parse_int(lexeme: &str) -> Option<BigInt> {
    let s: String = lexeme.chars().filter(|&c| c != '_').collect();
    let (radix, digits) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (16, rest)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (8, rest)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (2, rest)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..]) // legacy octal
    } else {
        (10, s.as_str())
    };
    BigInt::parse_bytes(digits.as_bytes(), radix)
}

/// Parses a float literal lexeme into an exact rational.
pub fn parse_float(lexeme: &str) -> Option<BigRational> {
    let s: String = lexeme.chars().filter(|&c| c != '_').collect();
    let (mantissa, exp) = match s.find(['e', 'E']) {
        Some(i) => (&s[..i], s[i + 1..].parse::<i32>().ok()?),
        None => (s.as_str(), 0),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    let digits = format!("{int_part}{frac_part}");
    let digits = if digits.is_empty() { "0".to_string() } else { digits };
    let n = BigInt::parse_bytes(digits.as_bytes(), 10)?;
    let mut r = BigRational::from_integer(n);
    let scale = exp - frac_part.len() as i32;
    let ten = BigInt::from(10);
    if scale > 0 {
        r *= BigRational::from_integer(ten.pow(scale as u32));
    } else if scale < 0 {
        r /= BigRational::from_integer(ten.pow((-scale) as u32));
    }
    Some(r)
}

/// Parses an imaginary literal, e.g. `2i` or `1.5i`.
pub fn parse_imag(lexeme: &str) -> Option<Constant> {
    let body = lexeme.strip_suffix('i')?;
    let im = if body.contains(['.', 'e', 'E']) {
        parse_float(body)?
    } else {
        BigRational::from_integer(parse_int(body)?)
    };
    Some(Constant::Complex(BigRational::zero(), im))
}

/// Evaluates a binary operation on two constants. Returns an error
/// message fragment on failure.
pub fn binary(op: BinOp, a: &Constant, b: &Constant) -> Result<Constant, String> {
    use Constant::*;
    match op {
        BinOp::LAnd | BinOp::LOr => match (a, b) {
            (Bool(x), Bool(y)) => Ok(Bool(if op == BinOp::LAnd { *x && *y } else { *x || *y })),
            _ => Err(format!("operator {} not defined on {}", op.symbol(), kind_name(a))),
        },
        BinOp::Eq | BinOp::NotEq => {
            let eq = const_eq(a, b)?;
            Ok(Bool(if op == BinOp::Eq { eq } else { !eq }))
        }
        BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq => {
            let ord = const_cmp(a, b)?;
            Ok(Bool(match op {
                BinOp::Less => ord.is_lt(),
                BinOp::LessEq => ord.is_le(),
                BinOp::Greater => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::Add if matches!((a, b), (Str(_), Str(_))) => {
            if let (Str(x), Str(y)) = (a, b) {
                Ok(Str(format!("{x}{y}")))
            } else {
                unreachable!()
            }
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arith(op, a, b),
        BinOp::Rem => match (a, b) {
            (Int(_) | Rune(_), Int(y) | Rune(y)) => {
                if y.is_zero() {
                    return Err("division by zero".to_string());
                }
                let (x, y) = (int_of(a), int_of(b));
                Ok(promote_int(a, b, x % y))
            }
            (Float(_), _) | (_, Float(_)) => {
                Err("operator % not defined on untyped float".to_string())
            }
            _ => Err(format!("operator % not defined on {}", kind_name(a))),
        },
        BinOp::And | BinOp::Or | BinOp::Xor | BinOp::AndNot => match (a, b) {
            (Int(_) | Rune(_), Int(_) | Rune(_)) => {
                let (x, y) = (int_of(a), int_of(b));
                let v = match op {
                    BinOp::And => x & y,
                    BinOp::Or => x | y,
                    BinOp::Xor => x ^ y,
                    _ => x & !y,
                };
                Ok(promote_int(a, b, v))
            }
            _ => Err(format!("operator {} not defined on {}", op.symbol(), kind_name(a))),
        },
        BinOp::Shl | BinOp::Shr => {
            let n = match b {
                Int(n) | Rune(n) => n,
                _ => return Err("shift count must be an integer".to_string()),
            };
            if n.is_negative() {
                return Err("negative shift count".to_string());
            }
            let n = n.to_u32().filter(|&n| n <= 512).ok_or("shift count too large")?;
            match a {
                Int(x) => Ok(Int(if op == BinOp::Shl { x << n } else { x >> n })),
                Rune(x) => Ok(Rune(if op == BinOp::Shl { x << n } else { x >> n })),
                Float(r) if r.is_integer() => {
                    let x = r.numer();
                    Ok(Int(if op == BinOp::Shl { x << n } else { x >> n }))
                }
                _ => Err(format!("shift of type {}", kind_name(a))),
            }
        }
        BinOp::Contains => match (a, b) {
            (Str(x), Str(y)) => Ok(Bool(x.contains(y.as_str()))),
            (Str(x), Rune(r)) => {
                let c = r.to_u32().and_then(char::from_u32).ok_or("invalid rune")?;
                Ok(Bool(x.contains(c)))
            }
            (Str(x), Int(r)) => {
                let c = r.to_u32().and_then(char::from_u32).ok_or("invalid rune")?;
                Ok(Bool(x.contains(c)))
            }
            _ => Err(format!("operator contains not defined on {}", kind_name(a))),
        },
    }
}

fn int_of(c: &Constant) -> BigInt {
    match c {
        Constant::Int(i) | Constant::Rune(i) => i.clone(),
        _ => BigInt::zero(),
    }
}

fn promote_int(a: &Constant, b: &Constant, v: BigInt) -> Constant {
    if matches!(a, Constant::Rune(_)) || matches!(b, Constant::Rune(_)) {
        Constant::Rune(v)
    } else {
        Constant::Int(v)
    }
}

fn arith(op: BinOp, a: &Constant, b: &Constant) -> Result<Constant, String> {
    use Constant::*;
    if !a.is_numeric() || !b.is_numeric() {
        if short_kind_name(a) != short_kind_name(b) {
            return Err(format!(
                "mismatched types {} and {}",
                short_kind_name(a),
                short_kind_name(b)
            ));
        }
        return Err(format!("operator {} not defined on {}", op.symbol(), kind_name(a)));
    }
    let rank = a.rank().max(b.rank());
    match rank {
        0 | 1 => {
            let (x, y) = (int_of(a), int_of(b));
            let v = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if y.is_zero() {
                        return Err("division by zero".to_string());
                    }
                    x / y
                }
                _ => unreachable!(),
            };
            Ok(promote_int(a, b, v))
        }
        2 => {
            let x = a.as_rational().ok_or("mismatched constant kinds")?;
            let y = b.as_rational().ok_or("mismatched constant kinds")?;
            let v = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if y.is_zero() {
                        return Err("division by zero".to_string());
                    }
                    x / y
                }
                _ => unreachable!(),
            };
            Ok(Float(v))
        }
        _ => {
            let (ar, ai) = a.as_complex().ok_or("mismatched constant kinds")?;
            let (br, bi) = b.as_complex().ok_or("mismatched constant kinds")?;
            let v = match op {
                BinOp::Add => (ar + br, ai + bi),
                BinOp::Sub => (ar - br, ai - bi),
                BinOp::Mul => (&ar * &br - &ai * &bi, &ar * &bi + &ai * &br),
                BinOp::Div => {
                    let d = &br * &br + &bi * &bi;
                    if d.is_zero() {
                        return Err("division by zero".to_string());
                    }
                    ((&ar * &br + &ai * &bi) / &d, (&ai * &br - &ar * &bi) / &d)
                }
                _ => unreachable!(),
            };
            Ok(Complex(v.0, v.1))
        }
    }
}

fn mismatched(a: &Constant, b: &Constant) -> String {
    format!("mismatched types {} and {}", short_kind_name(a), short_kind_name(b))
}

fn const_eq(a: &Constant, b: &Constant) -> Result<bool, String> {
    use Constant::*;
    match (a, b) {
        (Bool(x), Bool(y)) => Ok(x == y),
        (Str(x), Str(y)) => Ok(x == y),
        _ if a.is_numeric() && b.is_numeric() => {
            let (ar, ai) = a.as_complex().ok_or_else(|| mismatched(a, b))?;
            let (br, bi) = b.as_complex().ok_or_else(|| mismatched(a, b))?;
            Ok(ar == br && ai == bi)
        }
        _ => Err(mismatched(a, b)),
    }
}

fn const_cmp(a: &Constant, b: &Constant) -> Result<std::cmp::Ordering, String> {
    use Constant::*;
    match (a, b) {
        (Str(x), Str(y)) => Ok(x.cmp(y)),
        _ if a.rank() <= 2 && b.rank() <= 2 => {
            let x = a.as_rational().ok_or_else(|| mismatched(a, b))?;
            let y = b.as_rational().ok_or_else(|| mismatched(a, b))?;
            Ok(x.cmp(&y))
        }
        _ if a.is_numeric() != b.is_numeric() => Err(mismatched(a, b)),
        _ => Err(format!("operator < not defined on {}", kind_name(a))),
    }
}

/// Evaluates a unary operation on a constant.
pub fn unary(op: UnOp, a: &Constant) -> Result<Constant, String> {
    use Constant::*;
    match (op, a) {
        (UnOp::Pos, c) if c.is_numeric() => Ok(c.clone()),
        (UnOp::Neg, Int(x)) => Ok(Int(-x)),
        (UnOp::Neg, Rune(x)) => Ok(Rune(-x)),
        (UnOp::Neg, Float(x)) => Ok(Float(-x)),
        (UnOp::Neg, Complex(re, im)) => Ok(Complex(-re, -im)),
        (UnOp::Not, Bool(b)) => Ok(Bool(!b)),
        (UnOp::BitNot, Int(x)) => Ok(Int(!x)),
        (UnOp::BitNot, Rune(x)) => Ok(Rune(!x)),
        _ => Err(format!("operator {} not defined on {}", op.symbol(), kind_name(a))),
    }
}

pub fn kind_name(c: &Constant) -> &'static str {
    match c {
        Constant::Bool(_) => "untyped bool",
        Constant::Str(_) => "untyped string",
        Constant::Int(_) => "untyped int",
        Constant::Rune(_) => "untyped rune",
        Constant::Float(_) => "untyped float",
        Constant::Complex(..) => "untyped complex",
    }
}

/// The default-type name, as diagnostics spell it.
pub fn short_kind_name(c: &Constant) -> &'static str {
    match c {
        Constant::Bool(_) => "bool",
        Constant::Str(_) => "string",
        Constant::Int(_) => "int",
        Constant::Rune(_) => "rune",
        Constant::Float(_) => "float64",
        Constant::Complex(..) => "complex128",
    }
}

/// Checks that `c` is representable as a value of type `ty` and returns
/// the (possibly converted) constant, e.g. an integer-valued float
/// materializing into an int type.
pub fn representable(
    reg: &TypeRegistry,
    c: &Constant,
    ty: TypeId,
) -> Result<Constant, String> {
    let u = reg.underlying(ty);
    match reg.get(u) {
        Type::Bool => match c {
            Constant::Bool(_) => Ok(c.clone()),
            _ => Err(mismatch(reg, c, ty)),
        },
        Type::Str => match c {
            Constant::Str(_) => Ok(c.clone()),
            _ => Err(mismatch(reg, c, ty)),
        },
        Type::Int(kind) => {
            let i = match c {
                Constant::Int(i) | Constant::Rune(i) => i.clone(),
                Constant::Float(r) if r.is_integer() => r.numer().clone(),
                Constant::Float(_) => {
                    return Err(format!("constant {c} truncated to integer"));
                }
                _ => return Err(mismatch(reg, c, ty)),
            };
            if !int_fits(&i, *kind) {
                return Err(format!("constant {i} overflows {}", reg.describe(ty)));
            }
            Ok(Constant::Int(i))
        }
        Type::Float32 | Type::Float64 => {
            let r = c.as_rational().ok_or_else(|| mismatch(reg, c, ty))?;
            let v = rational_to_f64(&r).unwrap_or(f64::INFINITY);
            if v.is_infinite() {
                return Err(format!("constant {c} overflows {}", reg.describe(ty)));
            }
            if matches!(reg.get(u), Type::Float32) && (v as f32).is_infinite() {
                return Err(format!("constant {c} overflows {}", reg.describe(ty)));
            }
            Ok(Constant::Float(r))
        }
        Type::Complex64 | Type::Complex128 => {
            let (re, im) = c.as_complex().ok_or_else(|| mismatch(reg, c, ty))?;
            Ok(Constant::Complex(re, im))
        }
        _ => Err(mismatch(reg, c, ty)),
    }
}

fn mismatch(reg: &TypeRegistry, c: &Constant, ty: TypeId) -> String {
    format!("cannot use {} (type {}) as type {}", c, kind_name(c), reg.describe(ty))
}

fn int_fits(i: &BigInt, kind: IntKind) -> bool {
    if kind.is_unsigned() {
        if i.is_negative() {
            return false;
        }
        match kind.bits() {
            8 => i.to_u8().is_some(),
            16 => i.to_u16().is_some(),
            32 => i.to_u32().is_some(),
            _ => i.to_u64().is_some(),
        }
    } else {
        match kind.bits() {
            8 => i.to_i8().is_some(),
            16 => i.to_i16().is_some(),
            32 => i.to_i32().is_some(),
            _ => i.to_i64().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Constant {
        Constant::Int(BigInt::from(v))
    }

    #[test]
    fn integer_literals() {
        assert_eq!(parse_int("42").unwrap(), BigInt::from(42));
        assert_eq!(parse_int("0x2A").unwrap(), BigInt::from(42));
        assert_eq!(parse_int("0o52").unwrap(), BigInt::from(42));
        assert_eq!(parse_int("052").unwrap(), BigInt::from(42));
        assert_eq!(parse_int("0b101010").unwrap(), BigInt::from(42));
        assert_eq!(parse_int("1_000_000").unwrap(), BigInt::from(1_000_000));
    }

    #[test]
    fn float_literals_are_exact() {
        let r = parse_float("0.1").unwrap();
        assert_eq!(r, BigRational::new(BigInt::from(1), BigInt::from(10)));
        let r = parse_float("1e3").unwrap();
        assert_eq!(r, BigRational::from_integer(BigInt::from(1000)));
        let r = parse_float("2.5e-1").unwrap();
        assert_eq!(r, BigRational::new(BigInt::from(1), BigInt::from(4)));
    }

    #[test]
    fn exact_arithmetic_beyond_f64() {
        // (1/10 + 2/10) == 3/10 exactly, which f64 cannot represent.
        let a = Constant::Float(parse_float("0.1").unwrap());
        let b = Constant::Float(parse_float("0.2").unwrap());
        let c = binary(BinOp::Add, &a, &b).unwrap();
        assert_eq!(c, Constant::Float(BigRational::new(BigInt::from(3), BigInt::from(10))));
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(binary(BinOp::Div, &int(5), &int(2)).unwrap(), int(2));
        assert_eq!(binary(BinOp::Div, &int(-5), &int(2)).unwrap(), int(-2));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(binary(BinOp::Div, &int(1), &int(0)).is_err());
        assert!(binary(BinOp::Rem, &int(1), &int(0)).is_err());
    }

    #[test]
    fn float_modulo_is_an_error() {
        let f = Constant::Float(parse_float("1.5").unwrap());
        let err = binary(BinOp::Rem, &f, &int(1)).unwrap_err();
        assert!(err.contains("not defined on untyped float"));
    }

    #[test]
    fn shifts() {
        assert_eq!(binary(BinOp::Shl, &int(1), &int(10)).unwrap(), int(1024));
        assert_eq!(binary(BinOp::Shr, &int(1024), &int(4)).unwrap(), int(64));
        assert!(binary(BinOp::Shl, &int(1), &int(-1)).is_err());
    }

    #[test]
    fn comparisons_fold() {
        assert_eq!(binary(BinOp::Less, &int(1), &int(2)).unwrap(), Constant::Bool(true));
        let a = Constant::Str("a".into());
        let b = Constant::Str("b".into());
        assert_eq!(binary(BinOp::Less, &a, &b).unwrap(), Constant::Bool(true));
    }

    #[test]
    fn contains_folds() {
        let s = Constant::Str("hello".into());
        let sub = Constant::Str("ell".into());
        assert_eq!(binary(BinOp::Contains, &s, &sub).unwrap(), Constant::Bool(true));
        let r = Constant::Rune(BigInt::from('h' as u32));
        assert_eq!(binary(BinOp::Contains, &s, &r).unwrap(), Constant::Bool(true));
    }

    #[test]
    fn representability() {
        let reg = TypeRegistry::new();
        assert!(representable(&reg, &int(300), types::INT8).is_err());
        assert!(representable(&reg, &int(127), types::INT8).is_ok());
        assert!(representable(&reg, &int(-1), types::UINT).is_err());
        let half = Constant::Float(parse_float("0.5").unwrap());
        let err = representable(&reg, &half, types::INT).unwrap_err();
        assert!(err.contains("truncated to integer"), "{err}");
        // An integer-valued float is fine as an int.
        let two = Constant::Float(parse_float("2.0").unwrap());
        assert!(representable(&reg, &two, types::INT).is_ok());
    }

    #[test]
    fn rune_promotion() {
        let r = Constant::Rune(BigInt::from(65));
        let sum = binary(BinOp::Add, &r, &int(1)).unwrap();
        assert!(matches!(sum, Constant::Rune(_)));
    }

    #[test]
    fn complex_arithmetic() {
        let i = parse_imag("2i").unwrap();
        let sq = binary(BinOp::Mul, &i, &i).unwrap();
        assert_eq!(sq.to_complex_f64().unwrap(), (-4.0, 0.0));
    }
}
