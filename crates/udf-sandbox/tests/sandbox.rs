use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use udf_core::{Error, Field, PrimitiveType, Stage, TableSchema, UdfData, UdfDefinition};
use udf_sandbox::{
    ColumnKey, CompiledUnit, HeaderUnit, ImportAllowlist, ParamSpec, ParameterShape,
    SampleInput, Sandbox, SandboxOptions, SymbolTable, UdfError, UdfReturn,
};

const SOURCE: &str = "\
use helpers;

fn udf(n: int, flag: bool, output) {
    let rows = helpers.double(n);
    return rows;
}
";

fn definition() -> UdfDefinition {
    UdfDefinition::new("rows", "udf", SOURCE)
}

fn unit(source: &str) -> CompiledUnit {
    CompiledUnit::new(source).entrypoint(
        "udf",
        vec![
            ParamSpec::new("n", ParameterShape::Int),
            ParamSpec::new("flag", ParameterShape::Bool).with_default(json!(false)),
        ],
        |call| {
            let n = call.require("n")?.as_i64().unwrap_or_default();
            let flag = call.require("flag")?.as_bool().unwrap_or_default();
            call.print(format!("n={n} flag={flag}"));
            let index: Vec<Value> = (0..n).map(|i| json!(i)).collect();
            let flags: Vec<Value> = (0..n).map(|_| json!(flag)).collect();
            Ok(UdfReturn::Columns(vec![
                (ColumnKey::from("fused_index"), index),
                (ColumnKey::from("flag"), flags),
            ]))
        },
    )
}

fn sandbox_with(unit: CompiledUnit) -> Sandbox {
    let mut symbols = SymbolTable::new();
    symbols.register("rows", unit);
    Sandbox::new(Arc::new(symbols))
}

fn natural_schema() -> TableSchema {
    TableSchema::new(vec![
        Field::new("fused_index", PrimitiveType::Int64),
        Field::new("flag", PrimitiveType::Bool),
    ])
}

#[test]
fn declared_schema_matching_the_sample_validates_without_warnings() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    let mut udf = definition().with_schema(natural_schema());
    let input = SampleInput::new().kwarg("n", json!("3")).kwarg("flag", json!("true"));

    let result = sandbox.execute(&mut udf, &input, &SandboxOptions::default())?;

    anyhow::ensure!(result.warnings.is_empty(), "{:?}", result.warnings);
    anyhow::ensure!(result.table_schema == Some(natural_schema()));
    anyhow::ensure!(result.stdout == "n=3 flag=true\n", "{:?}", result.stdout);
    let Some(UdfData::Table(table)) = result.data else {
        anyhow::bail!("expected a table");
    };
    anyhow::ensure!(table.num_rows() == 3);
    Ok(())
}

#[test]
fn string_false_is_the_only_false_string() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    for (flag, expected) in [("false", false), ("False", false), ("0", true), ("yes", true)] {
        let mut udf = definition();
        let input = SampleInput::new().arg(json!(1)).kwarg("flag", json!(flag));
        let result = sandbox.execute(&mut udf, &input, &SandboxOptions::default())?;
        let Some(UdfData::Table(table)) = result.data else {
            anyhow::bail!("expected a table");
        };
        let got = table.column("flag").map(|c| c.values[0].clone());
        anyhow::ensure!(got == Some(json!(expected)), "{flag:?} -> {got:?}");
    }
    Ok(())
}

#[test]
fn missing_identity_column_fails_unless_waived() -> anyhow::Result<()> {
    let source = "fn udf() { return [{\"a\": 1}]; }";
    let unit = CompiledUnit::new(source).entrypoint("udf", vec![], |_| {
        Ok(UdfReturn::Records(vec![json!({"a": 1})]))
    });
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source);

    let err = sandbox
        .execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(
        matches!(err, Error::Sandbox { stage: Stage::Validate, .. }),
        "{err}"
    );

    let waived = SandboxOptions {
        skip_index_validation: true,
        ..Default::default()
    };
    let result = sandbox.execute(&mut udf, &SampleInput::new(), &waived)?;
    anyhow::ensure!(result.error_message.is_none());
    // The schema used for validation is adopted by a definition that declared none.
    anyhow::ensure!(
        udf.table_schema == Some(TableSchema::new(vec![Field::new("a", PrimitiveType::Int64)]))
    );
    Ok(())
}

#[test]
fn undeclared_column_fails_validation() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    let mut udf = definition().with_schema(TableSchema::new(vec![Field::new(
        "fused_index",
        PrimitiveType::Int64,
    )]));
    let err = sandbox
        .execute(&mut udf, &SampleInput::new().arg(json!(2)), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(
        err.to_string()
            .contains("Additional columns specified that were not in the schema: [\"flag\"]"),
        "{err}"
    );
    Ok(())
}

#[test]
fn coercion_failure_reports_stage_and_line() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    let mut udf = definition();
    let err = sandbox
        .execute(
            &mut udf,
            &SampleInput::new().arg(json!("three")),
            &SandboxOptions::default(),
        )
        .unwrap_err();
    match err {
        Error::Sandbox {
            stage: Stage::Coerce,
            lineno,
            ..
        } => anyhow::ensure!(lineno == Some(3), "{lineno:?}"),
        other => anyhow::bail!("unexpected error {other}"),
    }

    let err = sandbox
        .execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(err.to_string().contains("missing required argument: 'n'"), "{err}");
    Ok(())
}

#[test]
fn stale_compiled_code_is_rejected() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit("an older revision"));
    let err = sandbox
        .execute(&mut definition(), &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(
        matches!(err, Error::Sandbox { stage: Stage::Prepare, .. }),
        "{err}"
    );

    let mut empty = UdfDefinition::new("rows", "udf", "  \n");
    let err = sandbox
        .execute(&mut empty, &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(matches!(err, Error::Validation(_)), "{err}");
    Ok(())
}

#[test]
fn runtime_errors_keep_captured_output() -> anyhow::Result<()> {
    let source = "fn udf() { print(\"before\"); raise ValueError(\"bad input\") }";
    let unit = CompiledUnit::new(source).entrypoint("udf", vec![], |call| {
        call.print("before");
        call.eprint("careful");
        Err(UdfError::new("bad input").class("ValueError").at_line(1))
    });
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source);

    let err = sandbox
        .execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    match err {
        Error::UdfRuntime {
            message,
            exception_class,
            lineno,
            stdout,
            stderr,
        } => {
            anyhow::ensure!(message == "bad input");
            anyhow::ensure!(exception_class.as_deref() == Some("ValueError"));
            anyhow::ensure!(lineno == Some(1));
            anyhow::ensure!(stdout == "before\n" && stderr == "careful\n");
        }
        other => anyhow::bail!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn elapsed_time_covers_only_the_call() -> anyhow::Result<()> {
    let source = "fn udf() { sleep(20ms) }";
    let unit = CompiledUnit::new(source).entrypoint("udf", vec![], |_| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(UdfReturn::Nothing)
    });
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source).with_schema(natural_schema());

    let result = sandbox.execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())?;
    let elapsed = result.time_taken.unwrap_or_default();
    anyhow::ensure!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
    anyhow::ensure!(result.data.is_none());
    anyhow::ensure!(result.table_schema == Some(TableSchema::default()));
    anyhow::ensure!(
        result.warnings
            == ["UDF is configured with a schema but returns `None`. An empty schema was set for this execution."]
    );
    Ok(())
}

#[test]
fn reserved_handles_are_injected_and_scoped() -> anyhow::Result<()> {
    let source = "fn udf(output, context) { output.data = ...; }";
    let unit = CompiledUnit::new(source).entrypoint(
        "udf",
        vec![
            ParamSpec::new("output", ParameterShape::OutputHandle),
            ParamSpec::new("context", ParameterShape::ExecutionContext),
        ],
        |call| {
            let scratch = call
                .context()
                .map(|c| c.tempdir().to_path_buf())
                .ok_or_else(|| UdfError::new("no context"))?;
            let exists = scratch.is_dir();
            let output = call.output().ok_or_else(|| UdfError::new("no output"))?;
            output.skip_index_validation = true;
            output.data = Some(UdfReturn::Records(vec![json!({
                "scratch": scratch.display().to_string(),
                "exists": exists,
            })]));
            Ok(UdfReturn::Nothing)
        },
    );
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source).with_parameter("output", json!("x"));

    let result = sandbox.execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())?;
    anyhow::ensure!(result.warnings.len() == 1, "{:?}", result.warnings);
    anyhow::ensure!(result.warnings[0].contains("reserved"));
    let Some(UdfData::Table(table)) = result.data else {
        anyhow::bail!("expected a table");
    };
    let row = &table.to_records()[0];
    anyhow::ensure!(row["exists"] == json!(true));
    let scratch = row["scratch"].as_str().unwrap_or_default();
    anyhow::ensure!(!std::path::Path::new(scratch).exists(), "scratch dir must be removed");
    Ok(())
}

#[test]
fn header_modules_are_visible_only_when_declared() -> anyhow::Result<()> {
    let helper_source = "fn double(n) { n * 2 }";
    let header_call = CompiledUnit::new(SOURCE).entrypoint(
        "udf",
        vec![ParamSpec::new("n", ParameterShape::Int)],
        |call| {
            let n = call.require("n")?.as_i64().unwrap_or_default();
            let doubled = call.modules().call("helpers", "double", &[json!(n)])?;
            Ok(UdfReturn::Records(vec![json!({"fused_index": 0, "doubled": doubled})]))
        },
    );

    let mut symbols = SymbolTable::new();
    symbols.register("rows", header_call);
    symbols.register_header(
        "helpers",
        HeaderUnit::new(helper_source).function("double", |args| {
            Ok(json!(args[0].as_i64().unwrap_or_default() * 2))
        }),
    );
    let sandbox = Sandbox::new(Arc::new(symbols));

    let mut with_header = definition().with_header("helpers", helper_source);
    let result = sandbox.execute(
        &mut with_header,
        &SampleInput::new().arg(json!(21)),
        &SandboxOptions::default(),
    )?;
    let Some(UdfData::Table(table)) = result.data else {
        anyhow::bail!("expected a table");
    };
    anyhow::ensure!(table.to_records()[0]["doubled"] == json!(42));

    // Same code, no header declared: the module is not in scope for this call.
    let err = sandbox
        .execute(&mut definition(), &SampleInput::new().arg(json!(1)), &SandboxOptions::default())
        .unwrap_err();
    match err {
        Error::UdfRuntime { exception_class, .. } => {
            anyhow::ensure!(exception_class.as_deref() == Some("ModuleNotFoundError"))
        }
        other => anyhow::bail!("unexpected error {other}"),
    }

    // A header whose source changed since registration is rejected up front.
    let mut stale = definition().with_header("helpers", "fn double(n) { n * 3 }");
    let err = sandbox
        .execute(&mut stale, &SampleInput::new().arg(json!(1)), &SandboxOptions::default())
        .unwrap_err();
    match err {
        Error::Sandbox {
            stage: Stage::Prepare,
            lineno,
            ..
        } => anyhow::ensure!(lineno == Some(1)),
        other => anyhow::bail!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn spatial_parameters_are_coerced_before_the_call() -> anyhow::Result<()> {
    let source = "fn udf(bounds: TileGeometry, tile: TileXyz) {}";
    let unit = CompiledUnit::new(source).entrypoint(
        "udf",
        vec![
            ParamSpec::new("bounds", ParameterShape::TileGeometry),
            ParamSpec::new("tile", ParameterShape::TileXyz).optional(),
        ],
        |call| {
            let geo = call
                .require("bounds")?
                .as_geo()
                .cloned()
                .ok_or_else(|| UdfError::new("bounds is not a feature table"))?;
            let tile_is_null = call.require("tile")?.is_null();
            let mut table = geo.to_table()?;
            table.push_column("fused_index", vec![json!(0)])?;
            table.push_column("tile_is_null", vec![json!(tile_is_null)])?;
            Ok(UdfReturn::Table(table))
        },
    );
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source);
    let bounds = udf_sandbox::TileXyz::new(1, 2, 3).bounds();
    let input = SampleInput::new()
        .arg(json!(format!(
            "[{}, {}, {}, {}]",
            bounds.minx, bounds.miny, bounds.maxx, bounds.maxy
        )))
        .kwarg("tile", Value::Null);

    let result = sandbox.execute(&mut udf, &input, &SandboxOptions::default())?;
    let Some(UdfData::Table(table)) = result.data else {
        anyhow::bail!("expected a table");
    };
    let row = &table.to_records()[0];
    anyhow::ensure!(row["x"] == json!(1) && row["y"] == json!(2) && row["z"] == json!(3), "{row}");
    anyhow::ensure!(row["tile_is_null"] == json!(true));
    Ok(())
}

#[test]
fn raw_output_skips_normalization() -> anyhow::Result<()> {
    let source = "fn udf() { 7 }";
    let unit =
        CompiledUnit::new(source).entrypoint("udf", vec![], |_| Ok(UdfReturn::Value(json!(7))));
    let sandbox = sandbox_with(unit);
    let mut udf = UdfDefinition::new("rows", "udf", source);

    let err = sandbox
        .execute(&mut udf, &SampleInput::new(), &SandboxOptions::default())
        .unwrap_err();
    anyhow::ensure!(err.to_string().contains("Unexpected result type"), "{err}");

    let raw = SandboxOptions {
        validate_output: false,
        ..Default::default()
    };
    let result = sandbox.execute(&mut udf, &SampleInput::new(), &raw)?;
    anyhow::ensure!(result.data == Some(UdfData::Json(json!(7))));
    Ok(())
}

#[test]
fn imports_outside_the_allowlist_are_rejected_before_binding() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    let mut udf = definition();
    udf.imports = vec!["pandas".to_string(), "helpers".to_string()];
    let options = SandboxOptions {
        allowed_imports: Some(ImportAllowlist::new(["numpy"])),
        ..Default::default()
    };
    let err = sandbox
        .execute(&mut udf, &SampleInput::new().arg(json!(1)), &options)
        .unwrap_err();
    anyhow::ensure!(err.to_string().contains("[\"pandas\", \"helpers\"]"), "{err}");

    let options = SandboxOptions {
        allowed_imports: Some(ImportAllowlist::new(["pandas"])),
        ..Default::default()
    };
    let mut udf = udf.with_header("helpers", "unused");
    let err = sandbox
        .execute(&mut udf, &SampleInput::new().arg(json!(1)), &options)
        .unwrap_err();
    // Allow-list passes; the unregistered header is what fails now.
    anyhow::ensure!(matches!(err, Error::Sandbox { stage: Stage::Prepare, .. }), "{err}");
    Ok(())
}

#[test]
fn positional_values_bind_in_declaration_order() -> anyhow::Result<()> {
    let sandbox = sandbox_with(unit(SOURCE));
    let mut udf = definition().with_parameter("flag", json!(true));
    let result = sandbox.execute(
        &mut udf,
        &SampleInput::new().arg(json!(2.9)),
        &SandboxOptions::default(),
    )?;
    anyhow::ensure!(result.stdout == "n=2 flag=true\n", "{:?}", result.stdout);

    let err = sandbox
        .execute(
            &mut udf,
            &SampleInput::new().arg(json!(1)).kwarg("n", json!(2)),
            &SandboxOptions::default(),
        )
        .unwrap_err();
    anyhow::ensure!(err.to_string().contains("multiple values"), "{err}");
    Ok(())
}
