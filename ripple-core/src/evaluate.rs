//! Formula Evaluation
//!
//! Computed entities carry a formula whose free names are bound to the
//! current values of other entities. Evaluation sits behind the narrow
//! [`Evaluate`] trait so the cascade scheduler never cares which engine
//! runs the formula.
//!
//! # Lua Engine
//!
//! [`LuaEvaluator`] runs formulas as Lua expressions, e.g.
//! `power and switchedOn`, in a whitelist-only environment:
//!
//! - the bindings, plus `math`, `string` and a few pure base functions
//! - reading any other global is an [`EvaluationError::UnboundName`]
//! - assigning to any global is an [`EvaluationError::Assignment`]
//! - an instruction-count hook aborts runaway formulas
//!
//! Each call gets a fresh interpreter, so nothing a formula does can leak
//! into the next one.

use std::collections::HashSet;

use indexmap::IndexMap;
use mlua::{Error as LuaError, HookTriggers, Lua, LuaSerdeExt, Table, Value as LuaValue};
use serde_json::Value;

use crate::error::EvaluationError;

/// Name → value bindings passed to a formula.
pub type Bindings = IndexMap<String, Value>;

/// Instructions a formula may execute before it is aborted.
pub const DEFAULT_INSTRUCTION_LIMIT: u32 = 1_000_000;

const SAFE_LIBRARIES: &[&str] = &["math", "string"];
const SAFE_FUNCTIONS: &[&str] = &["tostring", "tonumber", "type", "pairs", "ipairs", "next", "select"];

/// A pure formula evaluator.
pub trait Evaluate: Send + Sync {
    /// Evaluate `source` with exactly `bindings` in scope.
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<Value, EvaluationError>;
}

/// Sandboxed Lua 5.4 evaluator.
#[derive(Debug, Clone)]
pub struct LuaEvaluator {
    instruction_limit: u32,
}

impl LuaEvaluator {
    pub fn new() -> Self {
        Self {
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
        }
    }

    pub fn with_instruction_limit(instruction_limit: u32) -> Self {
        Self {
            instruction_limit: instruction_limit.max(1),
        }
    }

    fn environment(&self, lua: &Lua, bindings: &Bindings) -> mlua::Result<Table> {
        let env = lua.create_table()?;
        let globals = lua.globals();
        for name in SAFE_LIBRARIES.iter().chain(SAFE_FUNCTIONS) {
            let value: LuaValue = globals.get(*name)?;
            if !value.is_nil() {
                env.raw_set(*name, value)?;
            }
        }

        // Bindings live one level down so that every assignment, even to a
        // bound name, reaches `__newindex` on the environment.
        let scope = lua.create_table()?;
        let mut bound = HashSet::new();
        for (name, value) in bindings {
            bound.insert(name.clone());
            // Nil cannot be stored in a table; bound-but-null names are
            // answered by the scope's metatable.
            if !value.is_null() {
                scope.raw_set(name.as_str(), lua.to_value(value)?)?;
            }
        }

        let unbound = lua.create_table()?;
        unbound.set(
            "__index",
            lua.create_function(move |_, (_scope, name): (Table, String)| {
                if bound.contains(&name) {
                    Ok(LuaValue::Nil)
                } else {
                    Err(LuaError::external(EvaluationError::UnboundName(name)))
                }
            })?,
        )?;
        scope.set_metatable(Some(unbound));

        let guard = lua.create_table()?;
        guard.set("__index", scope)?;
        guard.set(
            "__newindex",
            lua.create_function(|_, (_env, name, _value): (Table, String, LuaValue)| -> mlua::Result<()> {
                Err(LuaError::external(EvaluationError::Assignment(name)))
            })?,
        )?;
        env.set_metatable(Some(guard));
        Ok(env)
    }
}

impl Default for LuaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluate for LuaEvaluator {
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<Value, EvaluationError> {
        let lua = Lua::new();
        let env = self.environment(&lua, bindings).map_err(|err| classify(&err))?;
        let chunk = lua.load(source).set_name("=formula").set_environment(env);

        let limit = self.instruction_limit;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(limit),
            move |_lua, _debug| Err(LuaError::external(EvaluationError::InstructionLimit(limit))),
        );
        let result: mlua::Result<LuaValue> = chunk.eval();
        lua.remove_hook();

        let value = result.map_err(|err| classify(&err))?;
        lua.from_value(value)
            .map_err(|err| EvaluationError::Conversion(err.to_string()))
    }
}

/// Map an engine error to the evaluation error it carries, if any.
fn classify(err: &LuaError) -> EvaluationError {
    match err {
        LuaError::SyntaxError { message, .. } => EvaluationError::Syntax(message.clone()),
        LuaError::RuntimeError(message) => EvaluationError::Runtime(message.clone()),
        LuaError::CallbackError { cause, .. } => classify(cause),
        LuaError::WithContext { cause, .. } => classify(cause),
        LuaError::ExternalError(inner) => inner
            .downcast_ref::<EvaluationError>()
            .cloned()
            .unwrap_or_else(|| EvaluationError::Runtime(inner.to_string())),
        other => EvaluationError::Runtime(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn boolean_formula() {
        let lua = LuaEvaluator::new();
        let src = "power and switchedOn";
        let on = bindings(&[("power", json!(true)), ("switchedOn", json!(true))]);
        let off = bindings(&[("power", json!(false)), ("switchedOn", json!(true))]);
        assert_eq!(lua.evaluate(src, &on).unwrap(), json!(true));
        assert_eq!(lua.evaluate(src, &off).unwrap(), json!(false));
    }

    #[test]
    fn libraries_and_tables() {
        let lua = LuaEvaluator::new();
        let scope = bindings(&[("a", json!(3)), ("b", json!(5)), ("name", json!("lamp"))]);
        assert_eq!(lua.evaluate("math.max(a, b) * 2", &scope).unwrap(), json!(10));
        assert_eq!(
            lua.evaluate("string.upper(name) .. '!'", &scope).unwrap(),
            json!("LAMP!")
        );
        assert_eq!(
            lua.evaluate("{ lit = a < b }", &scope).unwrap(),
            json!({ "lit": true })
        );
    }

    #[test]
    fn null_bindings_read_as_nil() {
        let lua = LuaEvaluator::new();
        let scope = bindings(&[("flag", Value::Null)]);
        assert_eq!(lua.evaluate("flag == nil", &scope).unwrap(), json!(true));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let lua = LuaEvaluator::new();
        let err = lua.evaluate("ghost or true", &Bindings::new()).unwrap_err();
        assert_eq!(err, EvaluationError::UnboundName("ghost".into()));

        // Nothing outside the whitelist is reachable.
        let err = lua.evaluate("os.exit(1)", &Bindings::new()).unwrap_err();
        assert_eq!(err, EvaluationError::UnboundName("os".into()));
    }

    #[test]
    fn assignment_is_rejected() {
        let lua = LuaEvaluator::new();
        let err = lua.evaluate("power = false", &bindings(&[("power", json!(true))])).unwrap_err();
        assert_eq!(err, EvaluationError::Assignment("power".into()));
    }

    #[test]
    fn runaway_formulas_are_stopped() {
        let lua = LuaEvaluator::with_instruction_limit(10_000);
        let err = lua.evaluate("while true do end", &Bindings::new()).unwrap_err();
        assert_eq!(err, EvaluationError::InstructionLimit(10_000));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let lua = LuaEvaluator::new();
        let err = lua.evaluate("power and", &bindings(&[("power", json!(true))])).unwrap_err();
        assert!(matches!(err, EvaluationError::Syntax(_)));
    }
}
