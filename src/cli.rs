//! # INFRACTL CLI
//!
//! Offline tooling for `AWSCluster` manifests. Nothing here talks to a cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run admission validation on a new spec
//! infractl validate --file cluster.yaml
//!
//! # Validate an update against the current spec
//! infractl validate --file cluster.yaml --old current.yaml
//!
//! # Convert a legacy v1alpha manifest to the current version
//! infractl convert --file legacy.yaml
//!
//! # Print the external names and ownership tag for a cluster
//! infractl names --namespace default --name prod
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cluster_infra_controller::constants::CONVERSION_DATA_ANNOTATION;
use cluster_infra_controller::controller::reconciler::validation::{
    apply_defaults, validate_create, validate_update,
};
use cluster_infra_controller::crd::conversion::{from_v1alpha, to_v1alpha, AwsClusterSpecV1Alpha};
use cluster_infra_controller::crd::tags::{cluster_tag_key, LIFECYCLE_OWNED};
use cluster_infra_controller::crd::AwsClusterSpec;
use cluster_infra_controller::model::naming;
use cluster_infra_controller::model::security_group::SecurityGroupRole;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Cluster Infrastructure Controller CLI
#[derive(Parser)]
#[command(name = "infractl")]
#[command(about = "Offline tooling for AWSCluster manifests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run create (or update, with --old) validation on a spec
    Validate {
        /// Manifest holding the new spec (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// Manifest holding the current spec; switches to update validation
        #[arg(long)]
        old: Option<PathBuf>,
    },
    /// Convert a legacy v1alpha spec to the current version
    Convert {
        /// Manifest holding the spec to convert
        #[arg(short, long)]
        file: PathBuf,

        /// Convert a current spec down to v1alpha instead
        #[arg(long)]
        to_legacy: bool,
    },
    /// Print deterministic external names for a cluster
    Names {
        #[arg(short, long)]
        namespace: String,

        #[arg(short = 'c', long)]
        name: String,
    },
}

/// A manifest file: a full object (`metadata` + `spec`) or a bare spec
struct Manifest<T> {
    spec: T,
    annotations: BTreeMap<String, String>,
}

fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<Manifest<T>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let (spec_value, annotations) = match value.get("spec") {
        Some(spec) => {
            let annotations = value
                .get("metadata")
                .and_then(|m| m.get("annotations"))
                .cloned()
                .map(serde_yaml::from_value::<BTreeMap<String, String>>)
                .transpose()
                .context("metadata.annotations must be a string map")?
                .unwrap_or_default();
            (spec.clone(), annotations)
        }
        None => (value, BTreeMap::new()),
    };

    let spec = serde_yaml::from_value(spec_value)
        .with_context(|| format!("{} does not hold a valid spec", path.display()))?;
    Ok(Manifest { spec, annotations })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infractl=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, old } => validate_command(&file, old.as_deref()),
        Commands::Convert { file, to_legacy } => convert_command(&file, to_legacy),
        Commands::Names { namespace, name } => {
            names_command(&namespace, &name);
            Ok(())
        }
    }
}

fn validate_command(file: &Path, old: Option<&Path>) -> Result<()> {
    let new: Manifest<AwsClusterSpec> = read_manifest(file)?;
    let new_spec = apply_defaults(new.spec);

    let result = match old {
        Some(old_path) => {
            let old: Manifest<AwsClusterSpec> = read_manifest(old_path)?;
            println!("Validating update {} -> {}", old_path.display(), file.display());
            validate_update(&apply_defaults(old.spec), &new_spec)
        }
        None => {
            println!("Validating {}", file.display());
            validate_create(&new_spec)
        }
    };

    match result {
        Ok(()) => {
            println!("✅ Spec is valid");
            Ok(())
        }
        Err(errors) => {
            println!("❌ Spec is invalid:");
            for e in errors.iter() {
                println!("   {}: {}", e.field, e.message);
            }
            bail!("{} validation error(s)", errors.0.len())
        }
    }
}

fn convert_command(file: &Path, to_legacy: bool) -> Result<()> {
    if to_legacy {
        let Manifest {
            spec,
            mut annotations,
        } = read_manifest::<AwsClusterSpec>(file)?;
        let legacy = to_v1alpha(&spec, &mut annotations)?;
        println!("{}", serde_yaml::to_string(&legacy)?);
        match annotations.get(CONVERSION_DATA_ANNOTATION) {
            Some(data) => println!("# {CONVERSION_DATA_ANNOTATION}: {data}"),
            None => println!("# nothing to preserve in {CONVERSION_DATA_ANNOTATION}"),
        }
    } else {
        let Manifest {
            spec,
            mut annotations,
        } = read_manifest::<AwsClusterSpecV1Alpha>(file)?;
        let preserved = annotations.get(CONVERSION_DATA_ANNOTATION).cloned();
        let current = from_v1alpha(&spec, &mut annotations)?;
        println!("{}", serde_yaml::to_string(&current)?);
        if let Some(data) = preserved {
            println!("# restored from {CONVERSION_DATA_ANNOTATION}: {data}");
        }
    }
    Ok(())
}

fn names_command(namespace: &str, name: &str) {
    let infra = naming::infra_name(namespace, name);
    println!("{:<16} {}", "INFRA NAME", infra);
    println!("{:<16} {}", "VPC", naming::vpc_name(&infra));
    for role in SecurityGroupRole::ALL {
        println!(
            "{:<16} {}",
            format!("SG {}", role.as_str()),
            naming::security_group_name(&infra, role)
        );
    }
    println!("{:<16} {}", "BASTION", naming::bastion_name(&infra));
    println!("{:<16} {}", "LOAD BALANCER", naming::load_balancer_name(&infra));
    println!(
        "{:<16} {}={}",
        "OWNER TAG",
        cluster_tag_key(&infra),
        LIFECYCLE_OWNED
    );
}
