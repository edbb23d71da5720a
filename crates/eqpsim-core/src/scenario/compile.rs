//! Scenario script compiler.
//!
//! Line-oriented grammar:
//!
//! ```text
//! [TcToEqp] CMD=XXXX [timeout=15s]
//! [EqpToTc] <payload tokens...>
//! [EqpToTc] every=1s count=60 [jitter=200ms] <payload tokens...>
//! [EqpToTc] window=10s count=2 <payload tokens...>
//! [Sim] sleep=500ms
//! [Sim] label=MAIN
//! [Sim] goto=MAIN
//! [Sim] loop=count=5 goto=MAIN
//! [Sim] fault=delay|fragment|drop|corrupt|disconnect|clear (duration=..|count=..) <params>
//! ```
//!
//! Blank lines and `#` comments are skipped, and an optional ordinal prefix
//! (`1) ` or `(1) `) is stripped. Compilation is two passes: the first builds
//! the step list and label index (rejecting duplicate labels), the second
//! rewrites every `goto`/`loop` target into its label's step index, so
//! jumps at execution time are plain index assignments. Any violation fails
//! the whole script; the equipment referencing it must not run a partial
//! plan.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use eqpsim_proto::parse_all;
use thiserror::Error;

use super::plan::ScenarioPlan;
use super::step::{EmitCount, EmitMode, FaultKind, FaultScopeSpec, ScenarioStep};

/// Scenario compilation failure. All variants except label resolution and
/// I/O carry the offending source line.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Line does not start with a `[Tag]`.
    #[error("{file}:{line}: invalid step tag: {text}")]
    InvalidTag {
        /// Source name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },
    /// Tag is not one of `TcToEqp`, `EqpToTc`, `Sim`.
    #[error("{file}:{line}: unknown tag [{tag}]")]
    UnknownTag {
        /// Source name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// The unrecognized tag.
        tag: String,
    },
    /// A required field is absent.
    #[error("{file}:{line}: {step} requires {field}")]
    MissingField {
        /// Source name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// Step kind being parsed.
        step: &'static str,
        /// Missing field, as written in the grammar.
        field: &'static str,
    },
    /// A field value failed to parse or violates its bounds.
    #[error("{file}:{line}: invalid {what}: {value}")]
    InvalidValue {
        /// Source name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// What was being parsed.
        what: &'static str,
        /// The offending value.
        value: String,
    },
    /// The same label is defined twice.
    #[error("{file}:{line}: duplicate label '{label}'")]
    DuplicateLabel {
        /// Source name.
        file: String,
        /// 1-based line number.
        line: usize,
        /// The duplicated label.
        label: String,
    },
    /// A `goto`/`loop` target has no matching label step.
    #[error("{file}: label '{label}' not found")]
    UnresolvedLabel {
        /// Source name.
        file: String,
        /// The unresolved target.
        label: String,
    },
    /// Script file could not be read.
    #[error("failed to read scenario file {file}")]
    Io {
        /// Path that failed.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Compiles a scenario script file.
pub fn compile_file(path: &Path) -> Result<ScenarioPlan, CompileError> {
    let file = path.display().to_string();
    let text = std::fs::read_to_string(path)
        .map_err(|source| CompileError::Io { file: file.clone(), source })?;
    compile(&file, &text)
}

/// Compiles scenario script text into an immutable plan.
pub fn compile(source: &str, text: &str) -> Result<ScenarioPlan, CompileError> {
    let mut steps = Vec::new();
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut jumps: Vec<(usize, String)> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = strip_ordinal_prefix(raw.trim());
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((tag, body)) = split_tag(trimmed) else {
            return Err(CompileError::InvalidTag {
                file: source.to_owned(),
                line,
                text: raw.trim().to_owned(),
            });
        };

        let step = if tag.eq_ignore_ascii_case("TcToEqp") {
            parse_wait(source, line, body)?
        } else if tag.eq_ignore_ascii_case("EqpToTc") {
            parse_eqp_to_tc(source, line, body)?
        } else if tag.eq_ignore_ascii_case("Sim") {
            match parse_sim(source, line, body)? {
                SimLine::Step(step) => {
                    if let ScenarioStep::Label { name } = &step {
                        if labels.contains_key(name) {
                            return Err(CompileError::DuplicateLabel {
                                file: source.to_owned(),
                                line,
                                label: name.clone(),
                            });
                        }
                        labels.insert(name.clone(), steps.len());
                    }
                    step
                }
                // Jump targets stay symbolic until the second pass; the
                // placeholder index is always rewritten.
                SimLine::Goto { label } => {
                    jumps.push((steps.len(), label));
                    ScenarioStep::Goto { target: usize::MAX }
                }
                SimLine::Loop { count, label } => {
                    jumps.push((steps.len(), label));
                    ScenarioStep::Loop { count, target: usize::MAX }
                }
            }
        } else {
            return Err(CompileError::UnknownTag {
                file: source.to_owned(),
                line,
                tag: tag.to_owned(),
            });
        };

        steps.push(step);
    }

    for (idx, label) in jumps {
        let Some(&resolved) = labels.get(&label) else {
            return Err(CompileError::UnresolvedLabel { file: source.to_owned(), label });
        };
        match &mut steps[idx] {
            ScenarioStep::Goto { target } | ScenarioStep::Loop { target, .. } => {
                *target = resolved;
            }
            _ => {}
        }
    }

    Ok(ScenarioPlan::new(source.to_owned(), steps, labels))
}

/// Outcome of parsing one `[Sim]` line. Jumps carry their target label
/// symbolically; everything else is already a finished step.
enum SimLine {
    Step(ScenarioStep),
    Goto { label: String },
    Loop { count: u32, label: String },
}

/// Strips an optional `1) ` / `(1) ` ordinal prefix.
fn strip_ordinal_prefix(line: &str) -> &str {
    let mut rest = line.strip_prefix('(').unwrap_or(line);
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return line;
    }
    rest = &rest[digits..];
    match rest.strip_prefix(')') {
        Some(after) => after.trim_start(),
        None => line,
    }
}

/// Splits a `[Tag] body` line, returning `None` when the tag is malformed.
fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let close = rest.find(']')?;
    let tag = rest[..close].trim();
    if tag.is_empty() {
        return None;
    }
    Some((tag, rest[close + 1..].trim()))
}

fn parse_wait(source: &str, line: usize, body: &str) -> Result<ScenarioStep, CompileError> {
    let map = parse_all(body);
    let cmd = map.get("CMD").filter(|v| !v.is_empty()).ok_or(CompileError::MissingField {
        file: source.to_owned(),
        line,
        step: "WAIT",
        field: "CMD=...",
    })?;

    let timeout_override = match map.get("TIMEOUT").filter(|v| !v.is_empty()) {
        Some(v) => {
            let d = parse_duration(v).ok_or_else(|| invalid(source, line, "timeout", v))?;
            if d.is_zero() {
                return Err(invalid(source, line, "timeout", v));
            }
            Some(d)
        }
        None => None,
    };

    Ok(ScenarioStep::Wait { expected_cmd: cmd.to_ascii_uppercase(), timeout_override })
}

fn parse_eqp_to_tc(source: &str, line: usize, body: &str) -> Result<ScenarioStep, CompileError> {
    let map = parse_all(body);
    if map.contains_key("EVERY") || map.contains_key("WINDOW") {
        return parse_emit(source, line, body, &map);
    }
    if body.is_empty() {
        return Err(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "SEND",
            field: "payload",
        });
    }
    Ok(ScenarioStep::Send { payload: body.to_owned() })
}

fn parse_emit(
    source: &str,
    line: usize,
    body: &str,
    map: &HashMap<String, String>,
) -> Result<ScenarioStep, CompileError> {
    let count_str = map.get("COUNT").filter(|v| !v.is_empty()).ok_or(CompileError::MissingField {
        file: source.to_owned(),
        line,
        step: "EMIT",
        field: "count=...",
    })?;
    let count = if count_str.eq_ignore_ascii_case("forever") {
        EmitCount::Forever
    } else {
        let n: u32 =
            count_str.parse().map_err(|_| invalid(source, line, "emit count", count_str))?;
        if n == 0 {
            return Err(invalid(source, line, "emit count", count_str));
        }
        EmitCount::Fixed(n)
    };

    let (mode, period) = if let Some(every) = map.get("EVERY") {
        let d = parse_duration(every).ok_or_else(|| invalid(source, line, "every", every))?;
        (EmitMode::Interval, d)
    } else if let Some(window) = map.get("WINDOW") {
        if count == EmitCount::Forever {
            return Err(invalid(source, line, "window emit count", count_str));
        }
        let d = parse_duration(window).ok_or_else(|| invalid(source, line, "window", window))?;
        (EmitMode::Window, d)
    } else {
        return Err(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "EMIT",
            field: "every=... or window=...",
        });
    };

    let jitter = match map.get("JITTER").filter(|v| !v.is_empty()) {
        Some(v) => Some(parse_duration(v).ok_or_else(|| invalid(source, line, "jitter", v))?),
        None => None,
    };

    let payload = strip_control_tokens(body);
    if payload.is_empty() {
        return Err(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "EMIT",
            field: "payload",
        });
    }

    Ok(ScenarioStep::Emit { mode, period, count, jitter, payload })
}

fn parse_sim(source: &str, line: usize, body: &str) -> Result<SimLine, CompileError> {
    let map = parse_all(body);

    if let Some(sleep) = map.get("SLEEP") {
        let duration =
            parse_duration(sleep).ok_or_else(|| invalid(source, line, "sleep", sleep))?;
        return Ok(SimLine::Step(ScenarioStep::Sleep { duration }));
    }

    if let Some(label) = map.get("LABEL").filter(|v| !v.is_empty()) {
        return Ok(SimLine::Step(ScenarioStep::Label { name: label.clone() }));
    }

    // Loop is checked before goto: a loop line carries both tokens and must
    // not be read as a plain jump.
    if let Some(loop_value) = map.get("LOOP") {
        let count = parse_loop_count(loop_value)
            .ok_or_else(|| invalid(source, line, "loop count", loop_value))?;
        let label = map.get("GOTO").filter(|v| !v.is_empty()).ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "LOOP",
            field: "goto=LABEL",
        })?;
        return Ok(SimLine::Loop { count, label: label.clone() });
    }

    if let Some(target) = map.get("GOTO").filter(|v| !v.is_empty()) {
        return Ok(SimLine::Goto { label: target.clone() });
    }

    if map.contains_key("FAULT") {
        return parse_fault(source, line, &map).map(SimLine::Step);
    }

    Err(invalid(source, line, "[Sim] command", body))
}

/// Parses a loop count written as `count=5` or a bare `5`.
fn parse_loop_count(value: &str) -> Option<u32> {
    let v = value.trim();
    let v = match v.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("count=") => v[6..].trim(),
        _ => v,
    };
    let count: u32 = v.parse().ok()?;
    (count > 0).then_some(count)
}

fn parse_fault(
    source: &str,
    line: usize,
    map: &HashMap<String, String>,
) -> Result<ScenarioStep, CompileError> {
    let type_str = map.get("FAULT").map_or("", String::as_str);

    let scope = if let Some(duration) = map.get("DURATION").filter(|v| !v.is_empty()) {
        let d =
            parse_duration(duration).ok_or_else(|| invalid(source, line, "duration", duration))?;
        if d.is_zero() {
            return Err(invalid(source, line, "duration", duration));
        }
        FaultScopeSpec::Duration(d)
    } else {
        let count = map.get("COUNT").filter(|v| !v.is_empty()).ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "FAULT",
            field: "duration=... or count=...",
        })?;
        let n: u32 = count.parse().map_err(|_| invalid(source, line, "fault count", count))?;
        if n == 0 {
            return Err(invalid(source, line, "fault count", count));
        }
        FaultScopeSpec::NextN(n)
    };

    let kind = if type_str.eq_ignore_ascii_case("delay") {
        let ms = map.get("MS").ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "fault=delay",
            field: "ms=...",
        })?;
        let delay = parse_duration(ms).ok_or_else(|| invalid(source, line, "delay ms", ms))?;
        let jitter = match map.get("JITTER") {
            Some(v) => parse_duration(v).ok_or_else(|| invalid(source, line, "jitter", v))?,
            None => Duration::ZERO,
        };
        FaultKind::Delay { delay, jitter }
    } else if type_str.eq_ignore_ascii_case("fragment") {
        let min = map.get("MINPARTS").ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "fault=fragment",
            field: "minParts=...",
        })?;
        let max = map.get("MAXPARTS").ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "fault=fragment",
            field: "maxParts=...",
        })?;
        let min_parts: u32 = min.parse().map_err(|_| invalid(source, line, "minParts", min))?;
        let max_parts: u32 = max.parse().map_err(|_| invalid(source, line, "maxParts", max))?;
        if min_parts == 0 || max_parts < min_parts {
            return Err(invalid(source, line, "fragment parts", &format!("{min}..{max}")));
        }
        FaultKind::Fragment { min_parts, max_parts }
    } else if type_str.eq_ignore_ascii_case("drop") {
        FaultKind::Drop { rate: parse_rate(source, line, map, "fault=drop")? }
    } else if type_str.eq_ignore_ascii_case("corrupt") {
        let rate = parse_rate(source, line, map, "fault=corrupt")?;
        let protect_framing = match map.get("PROTECTFRAMING") {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => true,
        };
        FaultKind::Corrupt { rate, protect_framing }
    } else if type_str.eq_ignore_ascii_case("disconnect") {
        let after_str = map.get("AFTER").ok_or(CompileError::MissingField {
            file: source.to_owned(),
            line,
            step: "fault=disconnect",
            field: "after=...",
        })?;
        let after =
            parse_duration(after_str).ok_or_else(|| invalid(source, line, "after", after_str))?;
        let down = match map.get("DOWN") {
            Some(v) => parse_duration(v).ok_or_else(|| invalid(source, line, "down", v))?,
            None => Duration::ZERO,
        };
        FaultKind::Disconnect { after, down }
    } else if type_str.eq_ignore_ascii_case("clear") {
        FaultKind::Clear
    } else {
        return Err(invalid(source, line, "fault type", type_str));
    };

    Ok(ScenarioStep::Fault { kind, scope })
}

fn parse_rate(
    source: &str,
    line: usize,
    map: &HashMap<String, String>,
    step: &'static str,
) -> Result<f64, CompileError> {
    let rate_str = map.get("RATE").ok_or(CompileError::MissingField {
        file: source.to_owned(),
        line,
        step,
        field: "rate=...",
    })?;
    let rate: f64 = rate_str.parse().map_err(|_| invalid(source, line, "rate", rate_str))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(invalid(source, line, "rate", rate_str));
    }
    Ok(rate)
}

/// Parses `"<n>ms"`, `"<n>s"`, or a bare integer (seconds).
fn parse_duration(value: &str) -> Option<Duration> {
    let v = value.trim().to_ascii_lowercase();
    if let Some(ms) = v.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(s) = v.strip_suffix('s') {
        return s.trim().parse().ok().map(Duration::from_secs);
    }
    v.parse().ok().map(Duration::from_secs)
}

/// Rebuilds the body with scheduling tokens removed, order preserved.
fn strip_control_tokens(body: &str) -> String {
    body.split_whitespace()
        .filter(|token| {
            !token.split_once('=').is_some_and(|(key, _)| {
                let key = key.trim();
                key.eq_ignore_ascii_case("every")
                    || key.eq_ignore_ascii_case("window")
                    || key.eq_ignore_ascii_case("count")
                    || key.eq_ignore_ascii_case("jitter")
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn invalid(source: &str, line: usize, what: &'static str, value: &str) -> CompileError {
    CompileError::InvalidValue {
        file: source.to_owned(),
        line,
        what,
        value: value.to_owned(),
    }
}
