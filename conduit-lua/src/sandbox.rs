//! Lua sandbox creation
//!
//! This module provides a restricted Lua sandbox that prevents access to
//! dangerous operations like filesystem I/O, network access, and process execution.
//!
//! Pipeline definitions are plain data, so the sandbox only needs enough of Lua
//! to build tables: tables, strings, math and coroutines, plus the `pipeline`
//! helper module.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value};

/// Upper bound on memory a definition may allocate while evaluating
const MEMORY_LIMIT: usize = 32 * 1024 * 1024;

/// Create a restricted Lua sandbox
///
/// This sandbox includes only basic Lua functionality (tables, strings, math, coroutines)
/// and does NOT include any I/O capabilities or the ability to load external code.
///
/// # Use Cases
/// - CLI: lint a `.conduit.lua` before submitting it
/// - Orchestrator: evaluate a project's definition when seeding a pipeline
///
/// # Security
/// This sandbox prevents:
/// - Network access
/// - File system access
/// - Process execution
/// - Loading external modules via require()
///
/// # Example
/// ```no_run
/// use conduit_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let definition: mlua::Table = lua
///     .load(r#"return pipeline.define { jobs = { { name = "lint", script = "make lint" } } }"#)
///     .eval()?;
/// let jobs: mlua::Table = definition.get("jobs")?;
/// assert_eq!(jobs.raw_len(), 1);
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    // Only allow: TABLE, STRING, MATH, COROUTINE
    // Explicitly exclude: IO, OS, PACKAGE, DEBUG
    let lua = unsafe {
        Lua::unsafe_new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
            LuaOptions::default(),
        )
    };

    lua.set_memory_limit(MEMORY_LIMIT)?;

    // Remove dangerous globals
    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;
    lua.globals().set("load", mlua::Nil)?;

    register_pipeline_module(&lua)?;

    Ok(lua)
}

/// Register the pipeline module
///
/// Helpers for writing definitions:
/// - `pipeline.define(def)` and `pipeline.job(def)` return their table as-is
/// - `pipeline.child(def, opts)` builds a child pipeline trigger
/// - `pipeline.project(path, opts)` builds a multi-project trigger
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    let define_fn = lua.create_function(|_, definition: Table| Ok(definition))?;
    pipeline.set("define", define_fn)?;

    let job_fn = lua.create_function(|_, job: Table| Ok(job))?;
    pipeline.set("job", job_fn)?;

    // pipeline.child(definition, { strategy = "depend" })
    let child_fn = lua.create_function(|lua, (definition, opts): (Table, Option<Table>)| {
        let trigger = lua.create_table()?;
        trigger.set("child", definition)?;
        copy_strategy(&trigger, opts)?;
        Ok(trigger)
    })?;
    pipeline.set("child", child_fn)?;

    // pipeline.project("group/name", { branch = "main", strategy = "depend" })
    let project_fn = lua.create_function(|lua, (path, opts): (String, Option<Table>)| {
        let trigger = lua.create_table()?;
        trigger.set("project", path)?;
        if let Some(opts) = &opts {
            let branch: Value = opts.get("branch")?;
            trigger.set("branch", branch)?;
        }
        copy_strategy(&trigger, opts)?;
        Ok(trigger)
    })?;
    pipeline.set("project", project_fn)?;

    lua.globals().set("pipeline", pipeline)?;

    Ok(())
}

fn copy_strategy(trigger: &Table, opts: Option<Table>) -> LuaResult<()> {
    if let Some(opts) = opts {
        let strategy: Value = opts.get("strategy")?;
        trigger.set("strategy", strategy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        // Should be able to create tables and use strings
        let result: i32 = lua
            .load(
                r#"
                local t = {a = 1, b = 2}
                return t.a + t.b
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, 3);

        let result: String = lua.load(r#"return string.upper("hello")"#).eval().unwrap();
        assert_eq!(result, "HELLO");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_code_loading() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());

        let result: LuaResult<()> = lua.load(r#"load("return 1")()"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_pipeline_define_is_passthrough() {
        let lua = create_sandbox().unwrap();

        let result: String = lua
            .load(
                r#"
            local def = pipeline.define({ stages = { "only" } })
            return def.stages[1]
        "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, "only");
    }

    #[test]
    fn test_pipeline_child_helper() {
        let lua = create_sandbox().unwrap();

        let trigger: Table = lua
            .load(r#"return pipeline.child({ jobs = {} }, { strategy = "depend" })"#)
            .eval()
            .unwrap();

        let strategy: String = trigger.get("strategy").unwrap();
        assert_eq!(strategy, "depend");
        assert!(trigger.get::<Table>("child").is_ok());
    }

    #[test]
    fn test_pipeline_project_helper() {
        let lua = create_sandbox().unwrap();

        let trigger: Table = lua
            .load(r#"return pipeline.project("ops/deploy", { branch = "stable" })"#)
            .eval()
            .unwrap();

        let project: String = trigger.get("project").unwrap();
        let branch: String = trigger.get("branch").unwrap();
        let strategy: Value = trigger.get("strategy").unwrap();
        assert_eq!(project, "ops/deploy");
        assert_eq!(branch, "stable");
        assert!(strategy.is_nil());
    }
}
