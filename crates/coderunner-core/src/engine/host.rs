//! Host modules importable by submissions.
//!
//! Each function first asks the execution's [`CapabilityTable`] whether it may
//! run. The module layout mirrors [`crate::guard::HOST_CATALOG`].

use rhai::module_resolvers::StaticModuleResolver;
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Module, Position, FLOAT, INT};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::snapshot::shape_of;
use crate::guard::{CapabilityTable, SandboxFault};

type HostResult<T> = Result<T, Box<EvalAltResult>>;

fn fault<T>(kind: &'static str, message: impl Into<String>) -> HostResult<T> {
    Err(SandboxFault::new(kind, message).into_error(Position::NONE))
}

fn number(value: &Dynamic) -> Option<FLOAT> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as FLOAT))
}

fn numbers(values: &Array) -> HostResult<Vec<FLOAT>> {
    values
        .iter()
        .map(|value| match number(value) {
            Some(n) => Ok(n),
            None => fault("TypeError", format!("expected a number, got {}", value.type_name())),
        })
        .collect()
}

/// Builds all host modules for one execution.
///
/// `max_elements` bounds arrays the host creates itself, so a single call
/// cannot allocate past the engine's array limit before the engine sees it.
pub fn build_modules(table: Rc<CapabilityTable>, max_elements: usize) -> StaticModuleResolver {
    let mut resolver = StaticModuleResolver::new();
    resolver.insert("time", time_module(table.clone()));
    resolver.insert("array", array_module(table.clone(), max_elements));
    resolver.insert("json", json_module(table));
    resolver
}

fn time_module(table: Rc<CapabilityTable>) -> Module {
    let mut module = Module::new();
    let started = Instant::now();

    let caps = table.clone();
    module.set_native_fn("now", move || -> HostResult<FLOAT> {
        caps.check("time", "now")?;
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(since_epoch.as_secs_f64())
    });

    let caps = table.clone();
    module.set_native_fn("perf_counter", move || -> HostResult<FLOAT> {
        caps.check("time", "perf_counter")?;
        Ok(started.elapsed().as_secs_f64())
    });

    let caps = table.clone();
    module.set_native_fn("sleep", move |seconds: FLOAT| -> HostResult<()> {
        caps.check("time", "sleep")?;
        sleep_for(seconds)
    });

    let caps = table;
    module.set_native_fn("sleep", move |seconds: INT| -> HostResult<()> {
        caps.check("time", "sleep")?;
        sleep_for(seconds as FLOAT)
    });

    module
}

fn sleep_for(seconds: FLOAT) -> HostResult<()> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(length) => {
            std::thread::sleep(length);
            Ok(())
        }
        Err(_) => fault("ValueError", "sleep length must be a non-negative number"),
    }
}

fn filled(value: FLOAT, len: INT, max_elements: usize) -> HostResult<Array> {
    if len < 0 {
        return fault("ValueError", "negative dimensions are not allowed");
    }
    if max_elements > 0 && len as usize > max_elements {
        return fault("MemoryError", format!("cannot allocate {} elements", len));
    }
    Ok(vec![Dynamic::from(value); len as usize])
}

fn filled_matrix(value: FLOAT, rows: INT, cols: INT, max_elements: usize) -> HostResult<Array> {
    if rows < 0 || cols < 0 {
        return fault("ValueError", "negative dimensions are not allowed");
    }
    if max_elements > 0 && (rows as u128) * (cols as u128) > max_elements as u128 {
        return fault("MemoryError", format!("cannot allocate {}x{} elements", rows, cols));
    }
    let row = filled(value, cols, max_elements)?;
    Ok((0..rows).map(|_| Dynamic::from(row.clone())).collect())
}

fn array_module(table: Rc<CapabilityTable>, max_elements: usize) -> Module {
    let mut module = Module::new();

    for (name, fill) in [("zeros", 0.0), ("ones", 1.0)] {
        let caps = table.clone();
        module.set_native_fn(name, move |len: INT| -> HostResult<Array> {
            caps.check("array", name)?;
            filled(fill, len, max_elements)
        });

        let caps = table.clone();
        module.set_native_fn(name, move |rows: INT, cols: INT| -> HostResult<Array> {
            caps.check("array", name)?;
            filled_matrix(fill, rows, cols, max_elements)
        });
    }

    let caps = table.clone();
    module.set_native_fn("arange", move |end: INT| -> HostResult<Array> {
        caps.check("array", "arange")?;
        arange(0, end, max_elements)
    });

    let caps = table.clone();
    module.set_native_fn("arange", move |start: INT, end: INT| -> HostResult<Array> {
        caps.check("array", "arange")?;
        arange(start, end, max_elements)
    });

    let caps = table.clone();
    module.set_native_fn("shape", move |value: Dynamic| -> HostResult<Dynamic> {
        caps.check("array", "shape")?;
        Ok(match shape_of(&value) {
            Some(dims) => Dynamic::from(dims.into_iter().map(Dynamic::from).collect::<Array>()),
            None => Dynamic::UNIT,
        })
    });

    let caps = table.clone();
    module.set_native_fn("sum", move |values: Array| -> HostResult<FLOAT> {
        caps.check("array", "sum")?;
        Ok(numbers(&values)?.iter().sum())
    });

    let caps = table.clone();
    module.set_native_fn("mean", move |values: Array| -> HostResult<FLOAT> {
        caps.check("array", "mean")?;
        let values = numbers(&values)?;
        if values.is_empty() {
            return fault("ValueError", "mean of empty array");
        }
        Ok(values.iter().sum::<FLOAT>() / values.len() as FLOAT)
    });

    module.set_sub_module("linalg", linalg_module(table));
    module
}

fn arange(start: INT, end: INT, max_elements: usize) -> HostResult<Array> {
    let len = end.saturating_sub(start).max(0);
    if max_elements > 0 && len as usize > max_elements {
        return fault("MemoryError", format!("cannot allocate {} elements", len));
    }
    Ok((start..end).map(Dynamic::from).collect())
}

fn linalg_module(table: Rc<CapabilityTable>) -> Module {
    let mut module = Module::new();

    let caps = table.clone();
    module.set_native_fn("dot", move |a: Array, b: Array| -> HostResult<FLOAT> {
        caps.check("array.linalg", "dot")?;
        if a.len() != b.len() {
            return fault(
                "ValueError",
                format!("shapes ({},) and ({},) not aligned", a.len(), b.len()),
            );
        }
        let (a, b) = (numbers(&a)?, numbers(&b)?);
        Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
    });

    let caps = table;
    module.set_native_fn("transpose", move |matrix: Array| -> HostResult<Array> {
        caps.check("array.linalg", "transpose")?;
        transpose(&matrix)
    });

    module
}

fn transpose(matrix: &Array) -> HostResult<Array> {
    let dims = shape_of(&Dynamic::from(matrix.clone())).unwrap_or_default();
    if dims.len() < 2 {
        return fault("ValueError", "transpose expects a rectangular 2-D array");
    }
    let (rows, cols) = (dims[0] as usize, dims[1] as usize);

    let mut columns: Vec<Array> = vec![Array::with_capacity(rows); cols];
    for row in matrix {
        if let Some(row) = row.read_lock::<Array>() {
            for (col, value) in row.iter().enumerate() {
                columns[col].push(value.clone());
            }
        }
    }
    Ok(columns.into_iter().map(Dynamic::from).collect())
}

fn json_module(table: Rc<CapabilityTable>) -> Module {
    let mut module = Module::new();

    let caps = table.clone();
    module.set_native_fn("dumps", move |value: Dynamic| -> HostResult<String> {
        caps.check("json", "dumps")?;
        serde_json::to_string(&value).or_else(|e| fault("ValueError", e.to_string()))
    });

    let caps = table;
    module.set_native_fn("loads", move |text: ImmutableString| -> HostResult<Dynamic> {
        caps.check("json", "loads")?;
        let value: serde_json::Value = match serde_json::from_str(text.as_str()) {
            Ok(value) => value,
            Err(e) => return fault("ValueError", format!("invalid JSON: {}", e)),
        };
        rhai::serde::to_dynamic(value)
    });

    module
}
