//! The builtin operations workers can apply.
//!
//! Task terms name operations by string; anything outside this table fails
//! the task (reported to the coordinator, never a crash).

use anyhow::bail;
use taskgrid_messages::Datum;

pub type Op = fn(&[Datum]) -> anyhow::Result<Datum>;

pub fn lookup(name: &str) -> Option<Op> {
    Some(match name {
        "add" => add,
        "sub" => sub,
        "mul" => mul,
        "sum" => sum,
        "inc" => inc,
        "identity" => identity,
        "concat" => concat,
        "throw" => throw,
        _ => return None,
    })
}

pub fn apply(
    name: &str,
    args: &[Datum],
) -> anyhow::Result<Datum> {
    match lookup(name) {
        Some(op) => op(args),
        None => bail!("unknown operation: {name}"),
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

fn number(value: &Datum) -> anyhow::Result<Number> {
    match value {
        Datum::Int(n) => Ok(Number::Int(*n)),
        Datum::Float(x) => Ok(Number::Float(*x)),
        other => bail!("expected a number, got {}", other.type_name()),
    }
}

fn arity(
    args: &[Datum],
    expected: usize,
) -> anyhow::Result<()> {
    if args.len() != expected {
        bail!("expected {} arguments, got {}", expected, args.len());
    }
    Ok(())
}

fn binary_numeric(
    args: &[Datum],
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> anyhow::Result<Datum> {
    arity(args, 2)?;
    Ok(match (number(&args[0])?, number(&args[1])?) {
        (Number::Int(a), Number::Int(b)) => Datum::Int(int_op(a, b)),
        (Number::Int(a), Number::Float(b)) => Datum::Float(float_op(a as f64, b)),
        (Number::Float(a), Number::Int(b)) => Datum::Float(float_op(a, b as f64)),
        (Number::Float(a), Number::Float(b)) => Datum::Float(float_op(a, b)),
    })
}

fn add(args: &[Datum]) -> anyhow::Result<Datum> {
    binary_numeric(args, i64::wrapping_add, |a, b| a + b)
}

fn sub(args: &[Datum]) -> anyhow::Result<Datum> {
    binary_numeric(args, i64::wrapping_sub, |a, b| a - b)
}

fn mul(args: &[Datum]) -> anyhow::Result<Datum> {
    binary_numeric(args, i64::wrapping_mul, |a, b| a * b)
}

/// Sums all arguments; a single list argument is summed elementwise.
fn sum(args: &[Datum]) -> anyhow::Result<Datum> {
    let items: Vec<Datum> = match args {
        [Datum::List(items)] => items.clone(),
        _ => args.to_vec(),
    };
    let mut acc = Datum::Int(0);
    for item in &items {
        acc = add(&[acc, item.clone()])?;
    }
    Ok(acc)
}

fn inc(args: &[Datum]) -> anyhow::Result<Datum> {
    arity(args, 1)?;
    add(&[args[0].clone(), Datum::Int(1)])
}

fn identity(args: &[Datum]) -> anyhow::Result<Datum> {
    arity(args, 1)?;
    Ok(args[0].clone())
}

/// Joins strings into a string, or anything else into a list.
fn concat(args: &[Datum]) -> anyhow::Result<Datum> {
    if args.iter().all(|arg| matches!(arg, Datum::Str(_))) {
        let mut joined = String::new();
        for arg in args {
            if let Datum::Str(part) = arg {
                joined.push_str(part);
            }
        }
        return Ok(Datum::Str(joined));
    }
    let mut items = Vec::new();
    for arg in args {
        match arg {
            Datum::List(inner) => items.extend(inner.iter().cloned()),
            other => items.push(other.clone()),
        }
    }
    Ok(Datum::List(items))
}

/// Always fails; used to exercise task-failure paths.
fn throw(args: &[Datum]) -> anyhow::Result<Datum> {
    match args.first() {
        Some(Datum::Str(message)) => bail!("{message}"),
        _ => bail!("task raised"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_ints_integral() -> anyhow::Result<()> {
        assert_eq!(apply("add", &[Datum::Int(1), Datum::Int(2)])?, Datum::Int(3));
        assert_eq!(
            apply("add", &[Datum::Int(1), Datum::Float(0.5)])?,
            Datum::Float(1.5)
        );
        Ok(())
    }

    #[test]
    fn sum_accepts_list_or_varargs() -> anyhow::Result<()> {
        let list = Datum::List(vec![Datum::Int(1), Datum::Int(2), Datum::Int(3)]);
        assert_eq!(apply("sum", &[list])?, Datum::Int(6));
        assert_eq!(
            apply("sum", &[Datum::Int(4), Datum::Int(5)])?,
            Datum::Int(9)
        );
        Ok(())
    }

    #[test]
    fn concat_joins_strings() -> anyhow::Result<()> {
        assert_eq!(
            apply(
                "concat",
                &[Datum::Str("ab".to_string()), Datum::Str("cd".to_string())]
            )?,
            Datum::Str("abcd".to_string())
        );
        Ok(())
    }

    #[test]
    fn throw_and_unknown_ops_fail() {
        assert!(apply("throw", &[]).is_err());
        assert!(apply("frobnicate", &[Datum::Int(1)]).is_err());
        assert!(apply("add", &[Datum::Str("x".to_string()), Datum::Int(1)]).is_err());
    }
}
