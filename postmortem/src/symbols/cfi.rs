// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Evaluation of the postfix unwind rules of `STACK CFI` records.

use smallvec::SmallVec;

/// Register recovery rules in effect at one address.
///
/// `.cfa` computes the canonical frame address, `.ra` the return address,
/// and every other entry the caller's value of a register.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfiRules {
    rules: Vec<(String, String)>,
}

impl CfiRules {
    pub(super) fn set(&mut self, register: &str, expression: &str) {
        match self.rules.iter_mut().find(|(r, _)| r == register) {
            Some((_, e)) => *e = expression.to_string(),
            None => self
                .rules
                .push((register.to_string(), expression.to_string())),
        }
    }

    /// Expression for `register`.
    pub fn get(&self, register: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(r, _)| r == register)
            .map(|(_, e)| e.as_str())
    }

    /// All rules, in the order they were first given
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().map(|(r, e)| (r.as_str(), e.as_str()))
    }
}

/// Evaluates a postfix expression.
///
/// `register` supplies the callee's registers and `.cfa` once known,
/// `memory` dereferences a pointer for `^`. Arithmetic wraps at `u64`;
/// callers truncate to the pointer width. Returns `None` when the expression
/// is malformed or touches unavailable data.
pub fn evaluate(
    expression: &str,
    register: &dyn Fn(&str) -> Option<u64>,
    memory: &dyn Fn(u64) -> Option<u64>,
) -> Option<u64> {
    let mut stack: SmallVec<[u64; 8]> = SmallVec::new();
    for token in expression.split_whitespace() {
        let binary = |stack: &mut SmallVec<[u64; 8]>, op: fn(u64, u64) -> Option<u64>| {
            let b = stack.pop()?;
            let a = stack.pop()?;
            stack.push(op(a, b)?);
            Some(())
        };
        match token {
            "+" => binary(&mut stack, |a, b| Some(a.wrapping_add(b)))?,
            "-" => binary(&mut stack, |a, b| Some(a.wrapping_sub(b)))?,
            "*" => binary(&mut stack, |a, b| Some(a.wrapping_mul(b)))?,
            "/" => binary(&mut stack, |a, b| (a as i64).checked_div(b as i64).map(|v| v as u64))?,
            "%" => binary(&mut stack, |a, b| (a as i64).checked_rem(b as i64).map(|v| v as u64))?,
            "@" => binary(&mut stack, |a, b| {
                (b != 0 && b.is_power_of_two()).then(|| a & b.wrapping_neg())
            })?,
            "^" => {
                let address = stack.pop()?;
                stack.push(memory(address)?);
            }
            _ => {
                let value = if let Ok(v) = token.parse::<i64>() {
                    v as u64
                } else if let Some(hex) = token.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16).ok()?
                } else {
                    register(token)?
                };
                stack.push(value);
            }
        }
    }
    match stack.as_slice() {
        [value] => Some(*value),
        _ => None,
    }
}
