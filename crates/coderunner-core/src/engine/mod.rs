//! In-process execution of one untrusted script.
//!
//! Every call to [`ExecutionEngine::execute`] builds a brand new `rhai::Engine`
//! with a restricted surface: `eval` and `exit` are disabled, the filesystem
//! module resolver is replaced by [`GuardedResolver`], host modules consult a
//! [`CapabilityTable`] built from the caller's blacklist, and `print`/`debug`
//! write into one [`SharedSink`]. Compilation is a separate step from running,
//! so a syntax error never produces output. Whatever the script does, the call
//! returns an [`EngineReport`].

pub mod host;
pub mod snapshot;
pub mod traceback;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::guard::{CapabilityTable, GuardedResolver, SandboxFault};
use crate::instrument::ResourceMeter;
use crate::sink::{SharedSink, DEFAULT_OUTPUT_LIMIT};
use crate::types::{EngineReport, ForbiddenRule, VariableMap};
use snapshot::{snapshot_scope, DEFAULT_MAX_VARIABLES, DEFAULT_PREVIEW_LEN};
use traceback::{format_runtime_error, format_syntax_error, STUDENT_SOURCE};

/// Symbols removed from the language before any submission is compiled.
pub const DISABLED_SYMBOLS: &[&str] = &["eval"];

/// Built-in functions replaced by stubs that raise `NameError`.
pub const SHADOWED_FUNCTIONS: &[&str] = &["exit"];

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

fn default_max_variables() -> usize {
    DEFAULT_MAX_VARIABLES
}

fn default_preview_len() -> usize {
    DEFAULT_PREVIEW_LEN
}

fn default_max_string_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_array_size() -> usize {
    1_000_000
}

fn default_max_map_size() -> usize {
    100_000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_expr_depth() -> usize {
    64
}

fn default_max_function_expr_depth() -> usize {
    32
}

fn default_max_modules() -> usize {
    16
}

/// Data limits enforced by the script engine itself. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLimits {
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_map_size")]
    pub max_map_size: usize,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default = "default_max_function_expr_depth")]
    pub max_function_expr_depth: usize,
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,
    #[serde(default)]
    pub max_operations: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
            max_map_size: default_max_map_size(),
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
            max_function_expr_depth: default_max_function_expr_depth(),
            max_modules: default_max_modules(),
            max_operations: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
    #[serde(default = "default_max_variables")]
    pub max_variables: usize,
    #[serde(default = "default_preview_len")]
    pub preview_len: usize,
    #[serde(default)]
    pub limits: EngineLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_limit: default_output_limit(),
            max_variables: default_max_variables(),
            preview_len: default_preview_len(),
            limits: EngineLimits::default(),
        }
    }
}

enum Outcome {
    Completed(VariableMap),
    Failed(String),
}

pub struct ExecutionEngine {
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Runs `code` to completion or failure and reports what happened.
    pub fn execute(&self, code: &str, blacklist: &[ForbiddenRule]) -> EngineReport {
        let table = Rc::new(CapabilityTable::resolve(blacklist));
        log::debug!("Resolved {} of {} blacklist rules", table.len(), blacklist.len());

        let sink = SharedSink::new(self.settings.output_limit);
        let engine = self.build_engine(table, &sink);
        let mut scope = self.initial_scope();

        let meter = ResourceMeter::start();
        let outcome = self.compile_and_run(&engine, &mut scope, code);
        let usage = meter.finish();

        let (output, truncated) = sink.snapshot();
        let mut report = EngineReport {
            success: false,
            output,
            error: None,
            truncated,
            memory_peak_mb: usage.memory_peak_mb,
            execution_time: Some(usage.execution_time),
            variables: None,
        };
        match outcome {
            Outcome::Completed(variables) => {
                report.success = true;
                report.variables = Some(variables);
            }
            Outcome::Failed(error) => report.error = Some(error),
        }
        report
    }

    fn build_engine(&self, table: Rc<CapabilityTable>, sink: &SharedSink) -> Engine {
        let limits = &self.settings.limits;
        let mut engine = Engine::new();

        for symbol in DISABLED_SYMBOLS {
            engine.disable_symbol(*symbol);
        }
        for name in SHADOWED_FUNCTIONS {
            shadow_function(&mut engine, *name);
        }

        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
        engine.set_max_modules(limits.max_modules);
        engine.set_max_operations(limits.max_operations);

        let modules = host::build_modules(table, limits.max_array_size);
        engine.set_module_resolver(GuardedResolver::new(modules));

        let stdout = sink.clone();
        engine.on_print(move |text| {
            stdout.write(text);
            stdout.write("\n");
        });
        let stderr = sink.clone();
        engine.on_debug(move |text, _source, _pos| {
            stderr.write(text);
            stderr.write("\n");
        });

        engine
    }

    fn initial_scope(&self) -> Scope<'static> {
        let mut info = Map::new();
        info.insert("output_limit".into(), (self.settings.output_limit as i64).into());
        info.insert("max_variables".into(), (self.settings.max_variables as i64).into());

        let mut scope = Scope::new();
        scope.push_constant("sandbox", info);
        scope
    }

    fn compile_and_run(&self, engine: &Engine, scope: &mut Scope, code: &str) -> Outcome {
        let mut ast = match engine.compile(code) {
            Ok(ast) => ast,
            Err(err) => {
                log::debug!("Submission failed to compile: {}", err);
                return Outcome::Failed(format_syntax_error(&err, code));
            }
        };
        ast.set_source(STUDENT_SOURCE);

        match engine.run_ast_with_scope(scope, &ast) {
            Ok(()) => Outcome::Completed(snapshot_scope(
                scope,
                self.settings.max_variables,
                self.settings.preview_len,
            )),
            Err(err) => {
                log::debug!("Submission raised: {}", err);
                Outcome::Failed(format_runtime_error(&err, code))
            }
        }
    }
}

// Functions registered on the engine take precedence over package functions.
fn shadow_function(engine: &mut Engine, name: &'static str) {
    let undefined = move || SandboxFault::new("NameError", format!("name '{}' is not defined", name));
    engine.register_fn(name, move || -> Result<(), Box<EvalAltResult>> {
        Err(undefined().into_error(Position::NONE))
    });
    engine.register_fn(name, move |_value: Dynamic| -> Result<(), Box<EvalAltResult>> {
        Err(undefined().into_error(Position::NONE))
    });
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TRUNCATION_MARKER;

    fn run(code: &str) -> EngineReport {
        ExecutionEngine::default().execute(code, &[])
    }

    fn run_with(code: &str, rules: &[(&str, &str)]) -> EngineReport {
        let blacklist: Vec<ForbiddenRule> = rules
            .iter()
            .map(|(path, reason)| ForbiddenRule {
                path: path.to_string(),
                reason: reason.to_string(),
            })
            .collect();
        ExecutionEngine::default().execute(code, &blacklist)
    }

    #[test]
    fn test_print_hello() {
        let report = run(r#"print("hi");"#);

        assert!(report.success);
        assert_eq!(report.output, "hi\n");
        assert!(report.error.is_none());
        assert!(!report.truncated);
        assert!(report.execution_time.unwrap() >= 0.0);
    }

    #[test]
    fn test_debug_shares_the_output_sink() {
        let report = run(r#"print("out"); debug("err");"#);

        assert!(report.success);
        assert!(report.output.starts_with("out\n"));
        assert!(report.output.contains("err"));
    }

    #[test]
    fn test_denied_module_import() {
        let report = run(r#"import "os" as os;"#);

        assert!(!report.success);
        let error = report.error.unwrap();
        assert!(error.ends_with("ImportError: Security: Import of 'os' is forbidden."));
        assert!(error.contains("File \"<student_code>\", line 1"));
    }

    #[test]
    fn test_unknown_module_import() {
        let report = run(r#"import "numpy" as np;"#);

        assert!(report.error.unwrap().ends_with("ImportError: No module named 'numpy'"));
    }

    #[test]
    fn test_syntax_error_produces_no_output() {
        let report = run("print(\"before\");\nlet x = ;");

        assert!(!report.success);
        assert_eq!(report.output, "");
        assert!(report.error.unwrap().contains("SyntaxError: "));
        assert!(report.variables.is_none());
    }

    #[test]
    fn test_eval_is_disabled() {
        let report = run(r#"let x = eval("40 + 2");"#);

        assert!(!report.success);
        assert!(report.variables.is_none());
    }

    #[test]
    fn test_exit_is_not_available() {
        let report = run("let a = 1;\nprint(\"x\");\nexit();\nlet b = 2;");

        assert!(!report.success);
        assert_eq!(report.output, "x\n");
        assert!(report.variables.is_none());
        assert!(report.error.unwrap().ends_with("NameError: name 'exit' is not defined"));

        let report = run("exit(3);");
        assert!(!report.success);
        assert!(report.error.unwrap().contains("NameError"));
    }

    #[test]
    fn test_sleep_rejects_unrepresentable_lengths() {
        let report = run("import \"time\" as time;\ntime::sleep(1e300);");

        assert!(!report.success);
        assert!(report.error.unwrap().contains("ValueError"));

        let report = run("import \"time\" as time;\ntime::sleep(-1);");
        assert!(report.error.unwrap().contains("ValueError"));
    }

    #[test]
    fn test_runtime_error_keeps_partial_output() {
        let report = run("print(\"start\");\nthrow \"boom\";");

        assert!(!report.success);
        assert_eq!(report.output, "start\n");
        let error = report.error.unwrap();
        assert!(error.contains("line 2"));
        assert!(error.ends_with("RuntimeError: boom"));
    }

    #[test]
    fn test_error_names_exception_kind() {
        let report = run("let x = 1 / 0;");
        assert!(report.error.unwrap().contains("ZeroDivisionError"));

        let report = run("let y = missing + 1;");
        assert!(report.error.unwrap().contains("NameError"));

        let report = run("let a = [1, 2]; let b = a[5];");
        assert!(report.error.unwrap().contains("IndexError"));
    }

    #[test]
    fn test_blacklisted_function_is_trapped() {
        let code = "import \"time\" as time;\nprint(\"napping\");\ntime::sleep(1);";
        let report = run_with(code, &[("time.sleep", "Sleeping is not allowed in this task")]);

        assert!(!report.success);
        assert_eq!(report.output, "napping\n");
        let error = report.error.unwrap();
        assert!(error.contains("FORBIDDEN: Sleeping is not allowed in this task"));
        assert!(error.starts_with("  File \"<student_code>\"") || error.starts_with("RuntimeError"));
    }

    #[test]
    fn test_blacklisted_nested_function_inside_script_function() {
        let code = r#"
fn score(a, b) {
    import "array" as np;
    np::linalg::dot(a, b)
}
let s = score([1, 2], [3, 4]);
"#;
        let report = run_with(code, &[("array.linalg.dot", "implement the dot product yourself")]);

        let error = report.error.unwrap();
        assert!(error.contains("FORBIDDEN: implement the dot product yourself"));
        assert!(error.contains("line 6, in <module>"));
        assert!(!error.contains("host.rs"));
    }

    #[test]
    fn test_unresolvable_rules_do_not_break_the_run() {
        let report = run_with(
            r#"import "time" as time; let t = time::now();"#,
            &[("pandas.DataFrame.apply", "no pandas"), ("bogus", "bad path")],
        );

        assert!(report.success);
        assert_eq!(report.variables.unwrap()["t"].type_name, "float");
    }

    #[test]
    fn test_variables_snapshot() {
        let code = r#"
import "array" as np;
let count = 3;
let name = "rhai";
let grid = np::zeros(2, 3);
let __secret = 1;
"#;
        let report = run(code);

        assert!(report.success);
        let vars = report.variables.unwrap();
        assert_eq!(vars["count"].type_name, "int");
        assert_eq!(vars["count"].value_preview, "3");
        assert_eq!(vars["name"].value_preview, "rhai");
        assert_eq!(vars["grid"].shape, Some(vec![2, 3]));
        assert!(!vars.contains_key("__secret"));
        assert!(!vars.contains_key("sandbox"));
        assert!(!vars.contains_key("np"));
    }

    #[test]
    fn test_variable_cap() {
        let code: String = (0..70).map(|i| format!("let v{:02} = {};\n", i, i)).collect();
        let report = run(&code);

        let vars = report.variables.unwrap();
        assert_eq!(vars.len(), 50);
        assert!(vars.contains_key("v49"));
        assert!(!vars.contains_key("v50"));
    }

    #[test]
    fn test_output_truncation() {
        let settings = EngineSettings {
            output_limit: 20,
            ..Default::default()
        };
        let report = ExecutionEngine::new(settings).execute("for i in 0..100 { print(i); }", &[]);

        assert!(report.success);
        assert!(report.truncated);
        assert_eq!(report.output.chars().count(), 20 + TRUNCATION_MARKER.chars().count());
        assert!(report.output.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_array_limit_reports_memory_error() {
        let settings = EngineSettings {
            limits: EngineLimits {
                max_array_size: 1000,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = ExecutionEngine::new(settings)
            .execute("let x = []; x.pad(100000000, 0);", &[]);

        assert!(!report.success);
        assert!(report.error.unwrap().contains("MemoryError"));
    }

    #[test]
    fn test_json_round_trip_through_host_module() {
        let code = r#"
import "json" as json;
let data = json::loads("{\"a\": [1, 2, 3]}");
print(json::dumps(data.a));
"#;
        let report = run(code);

        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.output, "[1,2,3]\n");
    }
}
