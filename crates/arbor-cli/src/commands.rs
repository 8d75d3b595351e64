use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use arbor_refs::Reference;
use arbor_replica::{InMemoryDurableStore, JsonCodec, ReplicaConfig};
use arbor_sdk::{Arbor, ArborConfig};
use arbor_types::{Catalog, Node, Record, Schema, TypeDef, TypeRef, Variant};
use colored::Colorize;
use serde_json::Value;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Resolve(args) => cmd_resolve(args, cli.format),
        Command::Check(args) => cmd_check(args),
        Command::Schema(args) => cmd_schema(args),
        Command::Simulate(args) => cmd_simulate(args, cli.format),
    }
}

fn cmd_resolve(args: ResolveArgs, format: OutputFormat) -> anyhow::Result<()> {
    let schema = load_schema(&args.schema)?;
    let root = load_state(&schema, &args.state)?;
    let reference = Reference::parse(&schema, &args.path)?;
    let node = arbor_refs::resolve(&reference, &root)?;
    let value = JsonCodec::new().to_value(&schema, reference.target(), &node)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Text => {
            println!(
                "{} {}",
                reference.path().to_string().bold(),
                format!(": {}", reference.target()).cyan()
            );
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

fn cmd_check(args: CheckArgs) -> anyhow::Result<()> {
    let schema = load_schema(&args.schema)?;
    load_state(&schema, &args.state)?;
    println!(
        "{} {} conforms to {}",
        "✓".green().bold(),
        args.state.display(),
        schema.root.to_string().cyan()
    );
    Ok(())
}

fn cmd_schema(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = load_schema(&args.schema)?;
    println!("root: {}", schema.root.to_string().cyan());
    println!("fingerprint: {}", schema.fingerprint().dimmed());
    for (name, def) in &schema.types {
        match def {
            TypeDef::Record(shape) => {
                let kind = if shape.is_entity() { "entity" } else { "record" };
                println!("\n{} {}", kind.yellow(), name.bold());
                for (field, field_shape) in &shape.fields {
                    let marker = if field_shape.optional { "?" } else { "" };
                    println!("  {field}{marker}: {}", field_shape.ty);
                }
            }
            TypeDef::Variant(family) => {
                println!("\n{} {}", "variant".yellow(), name.bold());
                for (tag, ty) in &family.cases {
                    println!("  {tag}: {ty}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_simulate(args: SimulateArgs, format: OutputFormat) -> anyhow::Result<()> {
    if args.replicas == 0 {
        bail!("--replicas must be at least 1");
    }
    let schema = Arc::new(load_schema(&args.schema)?);
    let config = match &args.config {
        Some(path) => ArborConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => ArborConfig::new("simulation"),
    };
    let replica_config = config
        .replica
        .clone()
        .unwrap_or_else(|| ReplicaConfig::fast(config.name.clone()));
    let root = match &args.root {
        Some(path) => load_state(&schema, path)?,
        None => zero_value(&schema, &schema.root)?,
    };

    let store = Arc::new(InMemoryDurableStore::new());
    let instances = (0..args.replicas)
        .map(|i| {
            Arbor::builder(format!("{}-{i}", config.name), schema.clone())
                .policy(config.precondition.clone())
                .default_root_value(root.clone())
                .replica_config(replica_config.clone())
                .replicated(store.clone())
                .build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let codec = JsonCodec::new();
    for (i, assignment) in args.assignments.iter().enumerate() {
        let (path, json) = parse_assignment(assignment)?;
        let instance = &instances[i % instances.len()];
        let reference = instance.reference(path)?;
        let value = codec.from_value(&schema, reference.target(), &json)?;
        instance
            .driver()
            .submit_replacement(reference, value)
            .with_context(|| format!("{} failed on {}", assignment, instance.name()))?;
        if format == OutputFormat::Text {
            println!("{} {} {}", instance.name().yellow(), "set".dimmed(), assignment);
        }
    }
    for instance in &instances {
        instance.flush()?;
    }

    let mut report = Vec::new();
    for instance in &instances {
        let snapshot = instance.snapshot()?;
        let durable = instance.replica().and_then(|r| r.applied_revision());
        let root = codec.to_value(&schema, &schema.root, &snapshot.root)?;
        match format {
            OutputFormat::Json => report.push(serde_json::json!({
                "instance": instance.name(),
                "revision": snapshot.revision,
                "durable_revision": durable,
                "root": root,
            })),
            OutputFormat::Text => {
                println!(
                    "\n{} revision {} durable {}",
                    instance.name().bold(),
                    snapshot.revision.to_string().cyan(),
                    durable.map_or("-".to_string(), |r| r.to_string()).cyan()
                );
                println!("{}", serde_json::to_string_pretty(&root)?);
            }
        }
    }
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    for instance in &instances {
        instance.close();
    }
    Ok(())
}

fn load_schema(path: &Path) -> anyhow::Result<Schema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    Schema::from_toml_str(&text).with_context(|| format!("parsing schema {}", path.display()))
}

fn load_state(schema: &Schema, path: &Path) -> anyhow::Result<Node> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading state {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing state {}", path.display()))?;
    let root = JsonCodec::new()
        .from_value(schema, &schema.root, &value)
        .with_context(|| format!("decoding state {}", path.display()))?;
    schema.validate(&schema.root, &root)?;
    Ok(root)
}

/// Split `PATH=JSON`.
fn parse_assignment(text: &str) -> anyhow::Result<(&str, Value)> {
    let Some((path, json)) = text.split_once('=') else {
        bail!("expected PATH=JSON, got {text:?}");
    };
    let value = serde_json::from_str(json).with_context(|| format!("bad JSON in {text:?}"))?;
    Ok((path.trim(), value))
}

/// The empty value of `ty`: false, zero, empty text and empty catalogs,
/// records of their required fields, and variants in their first case.
fn zero_value(schema: &Schema, ty: &TypeRef) -> anyhow::Result<Node> {
    Ok(match ty {
        TypeRef::Bool => Node::from(false),
        TypeRef::Int => Node::from(0i64),
        TypeRef::Float => Node::from(0.0f64),
        TypeRef::Text => Node::text(""),
        TypeRef::Catalog(_) => Node::from(Catalog::new()),
        TypeRef::Named(name) => {
            if let Some(shape) = schema.record_shape(name) {
                if shape.is_entity() {
                    bail!("cannot derive a default entity {name}; pass --root");
                }
                let mut record = Record::new(name);
                for (field, field_shape) in &shape.fields {
                    if field_shape.optional || field_shape.ty.is_phantom() {
                        continue;
                    }
                    record = record.with_field(field, zero_value(schema, &field_shape.ty)?);
                }
                Node::from(record)
            } else if let Some(family) = schema.variant_family(name) {
                let Some((tag, case)) = family.cases.first() else {
                    bail!("variant {name} has no cases");
                };
                Node::from(Variant::new(name, tag, zero_value(schema, case)?))
            } else {
                bail!("unknown type {name}");
            }
        }
        other => bail!("cannot derive a default {other}; pass --root"),
    })
}
