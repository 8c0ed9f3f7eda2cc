//! Capability guard for untrusted scripts
//!
//! Two layers restrict what a submission may touch. The first is fixed: a
//! baseline of module names whose import is always refused, whatever the
//! caller configured. The second is the caller's blacklist, resolved once per
//! execution into a [`CapabilityTable`] that every host function consults
//! before doing any work. Nothing global is patched; a table lives exactly as
//! long as the engine built around it.
//!
//! Blacklist paths address the host module catalog: `time.sleep`,
//! `array.linalg.dot`. A path that does not resolve (unknown module, missing
//! sub-module, missing function, or fewer than two segments) is skipped.

use rhai::module_resolvers::StaticModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Module, ModuleResolver, Position, Shared};
use std::collections::HashMap;

use crate::types::ForbiddenRule;

/// Modules that can never be imported, independent of configuration.
pub const DENIED_MODULES: &[&str] = &["os", "subprocess", "shutil", "sys", "importlib", "inspect"];

/// Shape of one host module: its functions and nested sub-modules.
#[derive(Debug)]
pub struct ModuleSpec {
    pub name: &'static str,
    pub functions: &'static [&'static str],
    pub submodules: &'static [ModuleSpec],
}

/// Every module a script may import.
pub const HOST_CATALOG: &[ModuleSpec] = &[
    ModuleSpec {
        name: "time",
        functions: &["now", "perf_counter", "sleep"],
        submodules: &[],
    },
    ModuleSpec {
        name: "array",
        functions: &["zeros", "ones", "arange", "shape", "sum", "mean"],
        submodules: &[ModuleSpec {
            name: "linalg",
            functions: &["dot", "transpose"],
            submodules: &[],
        }],
    },
    ModuleSpec {
        name: "json",
        functions: &["dumps", "loads"],
        submodules: &[],
    },
];

/// Error value raised by sandbox machinery, carrying the exception kind that
/// ends up in front of the message in the report.
#[derive(Debug, Clone)]
pub struct SandboxFault {
    pub kind: &'static str,
    pub message: String,
}

impl SandboxFault {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn into_error(self, pos: Position) -> Box<EvalAltResult> {
        EvalAltResult::ErrorRuntime(Dynamic::from(self), pos).into()
    }
}

/// Execution-scoped registry of denied host functions.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    denied: HashMap<String, String>,
}

impl CapabilityTable {
    /// Resolves blacklist rules against [`HOST_CATALOG`], skipping any rule
    /// that does not name an existing host function.
    pub fn resolve(rules: &[ForbiddenRule]) -> Self {
        let mut denied = HashMap::new();
        for rule in rules {
            match resolve_path(&rule.path) {
                Some(key) => {
                    log::debug!("Denying host function {}", key);
                    denied.insert(key, rule.reason.clone());
                }
                None => log::debug!("Skipping unresolvable blacklist path '{}'", rule.path),
            }
        }
        Self { denied }
    }

    /// Gate called at the top of every host function.
    pub fn check(&self, module_path: &str, function: &str) -> Result<(), Box<EvalAltResult>> {
        match self.denied.get(&format!("{}.{}", module_path, function)) {
            Some(reason) => Err(SandboxFault::new("RuntimeError", format!("FORBIDDEN: {}", reason))
                .into_error(Position::NONE)),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.denied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.denied.is_empty()
    }
}

fn resolve_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('.').map(str::trim).collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return None;
    }

    let mut module = HOST_CATALOG.iter().find(|spec| spec.name == parts[0])?;
    for part in &parts[1..parts.len() - 1] {
        module = module.submodules.iter().find(|spec| spec.name == *part)?;
    }

    let function = parts[parts.len() - 1];
    if !module.functions.contains(&function) {
        return None;
    }
    Some(parts.join("."))
}

pub fn is_denied_module(path: &str) -> bool {
    let root = path.split(['.', ':', '/']).next().unwrap_or(path);
    DENIED_MODULES.contains(&root)
}

/// Module resolver that enforces the import baseline before looking a module
/// up among the host modules built for this execution.
pub struct GuardedResolver {
    modules: StaticModuleResolver,
}

impl GuardedResolver {
    pub fn new(modules: StaticModuleResolver) -> Self {
        Self { modules }
    }
}

impl ModuleResolver for GuardedResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        if is_denied_module(path) {
            log::debug!("Refused import of denied module '{}'", path);
            return Err(SandboxFault::new(
                "ImportError",
                format!("Security: Import of '{}' is forbidden.", path),
            )
            .into_error(pos));
        }

        self.modules.resolve(engine, source, path, pos).map_err(|_| {
            SandboxFault::new("ImportError", format!("No module named '{}'", path)).into_error(pos)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str, reason: &str) -> ForbiddenRule {
        ForbiddenRule {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_resolves_top_level_function() {
        let table = CapabilityTable::resolve(&[rule("time.sleep", "no sleeping")]);

        assert_eq!(table.len(), 1);
        assert!(table.check("time", "sleep").is_err());
        assert!(table.check("time", "now").is_ok());
    }

    #[test]
    fn test_resolves_nested_function() {
        let table = CapabilityTable::resolve(&[rule("array.linalg.dot", "write it yourself")]);

        assert!(table.check("array.linalg", "dot").is_err());
    }

    #[test]
    fn test_unresolvable_paths_are_skipped() {
        let table = CapabilityTable::resolve(&[
            rule("pandas.DataFrame.apply", "no module"),
            rule("array.missing.dot", "no submodule"),
            rule("time.teleport", "no function"),
            rule("sleep", "too short"),
            rule("string.len", "core package"),
            rule("time..sleep", "empty segment"),
        ]);

        assert!(table.is_empty());
    }

    #[test]
    fn test_check_reports_reason() {
        let table = CapabilityTable::resolve(&[rule("json.loads", "parse by hand")]);
        let err = table.check("json", "loads").unwrap_err();

        match *err {
            EvalAltResult::ErrorRuntime(ref value, _) => {
                let fault = value.clone().try_cast::<SandboxFault>().unwrap();
                assert_eq!(fault.kind, "RuntimeError");
                assert_eq!(fault.message, "FORBIDDEN: parse by hand");
            }
            ref other => panic!("unexpected error: {:?}", other),
        }
        assert!(table.check("json", "dumps").is_ok());
    }

    #[test]
    fn test_denied_module_baseline() {
        for name in DENIED_MODULES {
            assert!(is_denied_module(name));
        }
        assert!(is_denied_module("os.path"));
        assert!(!is_denied_module("time"));
        assert!(!is_denied_module("ossify"));
    }
}
