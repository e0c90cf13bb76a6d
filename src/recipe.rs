//! Recipes: the ordered instructions a procedure executes.
//!
//! A recipe file has one instruction per line, whitespace separated:
//!
//! ```text
//! <seconds> set <t|s> <value>
//! <seconds> ramp <t|s> [<steps>] <value>
//! ```
//!
//! `t` is temperature in tenths of a degree, `s` is stirring speed in rpm.
//! Without `<steps>`, a ramp is split into steps of the configured step size.

use core::{fmt, str::FromStr};
use std::path::Path;

use fugit::SecsDurationU32;
use thiserror::Error;

use crate::packet::{Axis, CodecError, Command};

/// Problems with an otherwise well-formed procedure, found before anything is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Ramp duration of {duration_s}s is not a multiple of the {step_s}s step")]
    IndivisibleRamp { duration_s: u32, step_s: u32 },
    #[error("Ramp of {duration_s}s has no steps")]
    EmptyRamp { duration_s: u32 },
    #[error("Step size must be at least one second")]
    ZeroStepSize,
    #[error("Sampling period must be non-zero")]
    ZeroSamplePeriod,
}

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("Could not read recipe")]
    Io(#[from] std::io::Error),
    #[error("Recipe line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("Recipe line {line}: {source}")]
    Value {
        line: usize,
        #[source]
        source: CodecError,
    },
}

/// A single recipe line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Apply `command` once, then sample until `duration` has passed.
    Hold {
        duration: SecsDurationU32,
        command: Command,
    },
    /// Move `axis` linearly from its current device setpoint to `target`.
    Ramp {
        duration: SecsDurationU32,
        axis: Axis,
        target: u16,
        /// Overrides the configured step size when present.
        steps: Option<u32>,
    },
}

/// How a ramp is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub steps: u32,
    pub step: SecsDurationU32,
}

impl RampPlan {
    /// Setpoint for step `k` (1-based) of a ramp from `start` to `target`.
    ///
    /// Computed as `start + (target - start) * k / steps` rounded half away
    /// from zero, so the last step lands exactly on `target`.
    pub fn value_at(&self, start: u16, target: u16, k: u32) -> i64 {
        let delta = i64::from(target) - i64::from(start);
        let steps = i64::from(self.steps);
        let scaled = delta * i64::from(k);
        let rounded = if scaled >= 0 {
            (2 * scaled + steps) / (2 * steps)
        } else {
            -((-2 * scaled + steps) / (2 * steps))
        };
        i64::from(start) + rounded
    }
}

impl Instruction {
    pub fn duration(&self) -> SecsDurationU32 {
        match self {
            Instruction::Hold { duration, .. } | Instruction::Ramp { duration, .. } => *duration,
        }
    }

    /// Split a ramp into steps. `None` for holds.
    pub fn ramp_plan(&self, step_size: SecsDurationU32) -> Result<Option<RampPlan>, ConfigError> {
        let Instruction::Ramp {
            duration, steps, ..
        } = *self
        else {
            return Ok(None);
        };
        let duration_s = duration.to_secs();

        let (steps, step_s) = match steps {
            Some(steps) => {
                if steps == 0 {
                    return Err(ConfigError::EmptyRamp { duration_s });
                }
                if duration_s % steps != 0 {
                    return Err(ConfigError::IndivisibleRamp {
                        duration_s,
                        step_s: duration_s / steps,
                    });
                }
                (steps, duration_s / steps)
            }
            None => {
                let step_s = step_size.to_secs();
                if step_s == 0 {
                    return Err(ConfigError::ZeroStepSize);
                }
                if duration_s % step_s != 0 {
                    return Err(ConfigError::IndivisibleRamp { duration_s, step_s });
                }
                (duration_s / step_s, step_s)
            }
        };

        if steps == 0 || step_s == 0 {
            return Err(ConfigError::EmptyRamp { duration_s });
        }
        Ok(Some(RampPlan {
            steps,
            step: SecsDurationU32::secs(step_s),
        }))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Hold { duration, command } => {
                write!(f, "hold {}s, {}", duration.to_secs(), command)
            }
            Instruction::Ramp {
                duration,
                axis,
                target,
                ..
            } => write!(f, "ramp {} to {} over {}s", axis, target, duration.to_secs()),
        }
    }
}

fn syntax(line: usize, reason: impl Into<String>) -> RecipeError {
    RecipeError::Syntax {
        line,
        reason: reason.into(),
    }
}

fn parse_number<T: FromStr>(line: usize, token: &str, what: &str) -> Result<T, RecipeError> {
    token
        .parse()
        .map_err(|_| syntax(line, format!("invalid {what} '{token}'")))
}

fn parse_line(line: usize, text: &str) -> Result<Instruction, RecipeError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let [duration, kind, axis, rest @ ..] = tokens.as_slice() else {
        return Err(syntax(line, "expected '<seconds> <set|ramp> <t|s> <value>'"));
    };

    let duration = SecsDurationU32::secs(parse_number(line, duration, "duration")?);
    let axis: Axis = axis
        .parse()
        .map_err(|_| syntax(line, format!("unknown axis '{axis}', expected t or s")))?;
    let value_error = |source| RecipeError::Value { line, source };

    match (*kind, rest) {
        ("set", [value]) => {
            let command = Command::new(axis, parse_number(line, value, "value")?)
                .map_err(value_error)?;
            Ok(Instruction::Hold { duration, command })
        }
        ("ramp", [value]) | ("ramp", [_, value]) => {
            let steps = match rest {
                [steps, _] => Some(parse_number(line, steps, "step count")?),
                _ => None,
            };
            let target = Command::new(axis, parse_number(line, value, "value")?)
                .map_err(value_error)?
                .target();
            Ok(Instruction::Ramp {
                duration,
                axis,
                target,
                steps,
            })
        }
        ("set", _) | ("ramp", _) => Err(syntax(line, "wrong number of fields")),
        (other, _) => Err(syntax(line, format!("unknown instruction '{other}'"))),
    }
}

/// An ordered list of instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Procedure {
    instructions: Vec<Instruction>,
}

impl Procedure {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// Parse recipe text. Blank lines are skipped; line numbers in errors are 1-based.
    pub fn parse(text: &str) -> Result<Self, RecipeError> {
        let instructions = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| parse_line(index + 1, line))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { instructions })
    }

    /// Read and parse a recipe file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Check every ramp against `step_size`.
    pub fn validate(&self, step_size: SecsDurationU32) -> Result<(), ConfigError> {
        for instruction in &self.instructions {
            instruction.ramp_plan(step_size)?;
        }
        Ok(())
    }

    /// Nominal run time, ignoring protocol overhead.
    pub fn total_duration(&self) -> SecsDurationU32 {
        let secs = self
            .instructions
            .iter()
            .map(|i| i.duration().to_secs())
            .fold(0u32, u32::saturating_add);
        SecsDurationU32::secs(secs)
    }
}
