mod simulate;

use std::fs;
use std::path::PathBuf;
use std::process::exit;

use pipeflow_core::{runtime_limit_secs, OutputManifest};
use pipeflow_domain::RuntimeLimit;
use serde_json::json;

use crate::simulate::{Outcome, SimulationOptions};

const USAGE: &str = "uso:
  pipeflow simulate [--samples <N>] [--outcome complete|fail|cancel|timeout] [--max-runtime <SEG|FORMULA>]
                    [--storage <DIR>] [--registry <JSON>]
  pipeflow eval-runtime --formula <SEG|FORMULA> [--samples <N>]
  pipeflow inspect-manifest <ARCHIVO.json.gz>";

fn usage_error(msg: &str) -> ! {
    eprintln!("{msg}\n{USAGE}");
    exit(2)
}

/// Lee el valor que sigue a un flag (`--flag valor`).
fn flag_value(args: &[String], i: &mut usize) -> String {
    *i += 1;
    match args.get(*i) {
        Some(v) => v.clone(),
        None => usage_error(&format!("falta valor para {}", args[*i - 1])),
    }
}

fn parse_samples(raw: &str) -> usize {
    raw.parse().unwrap_or_else(|_| usage_error(&format!("--samples inválido: {raw}")))
}

fn cmd_simulate(args: &[String]) {
    let mut opts = SimulationOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--samples" => opts.samples = parse_samples(&flag_value(args, &mut i)),
            "--outcome" => {
                let raw = flag_value(args, &mut i);
                opts.outcome = raw.parse::<Outcome>().unwrap_or_else(|e| usage_error(&e));
            }
            "--max-runtime" => opts.max_runtime = Some(flag_value(args, &mut i)),
            "--storage" => opts.storage = Some(PathBuf::from(flag_value(args, &mut i))),
            "--registry" => opts.registry = Some(PathBuf::from(flag_value(args, &mut i))),
            other => usage_error(&format!("flag desconocido: {other}")),
        }
        i += 1;
    }
    match simulate::run(&opts) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report.to_json()).unwrap_or_default());
        }
        Err(e) => {
            eprintln!("[pipeflow simulate] error: {e}");
            exit(5);
        }
    }
}

fn cmd_eval_runtime(args: &[String]) {
    let mut formula: Option<String> = None;
    let mut samples = 1;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--formula" => formula = Some(flag_value(args, &mut i)),
            "--samples" => samples = parse_samples(&flag_value(args, &mut i)),
            other => usage_error(&format!("flag desconocido: {other}")),
        }
        i += 1;
    }
    let Some(raw) = formula else { usage_error("falta --formula") };
    let limit = match raw.trim().parse::<u64>() {
        Ok(secs) => RuntimeLimit::Seconds(secs),
        Err(_) => RuntimeLimit::Formula(raw.clone()),
    };
    match runtime_limit_secs(&limit, samples) {
        Ok(secs) => println!("{}", json!({"formula": raw, "samples": samples, "seconds": secs})),
        Err(e) => {
            eprintln!("[pipeflow eval-runtime] fórmula inválida: {e}");
            exit(3);
        }
    }
}

fn cmd_inspect_manifest(args: &[String]) {
    let Some(path) = args.first() else { usage_error("falta la ruta del manifest") };
    let bytes = fs::read(path).unwrap_or_else(|e| {
                                  eprintln!("[pipeflow inspect-manifest] {path}: {e}");
                                  exit(4)
                              });
    let manifest = match OutputManifest::from_gzip(&bytes) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("[pipeflow inspect-manifest] {e}");
            exit(3);
        }
    };
    let mut samples = serde_json::Map::new();
    let ids = manifest.files.samples.keys().chain(manifest.metadata.samples.keys());
    for id in ids {
        if samples.contains_key(id) {
            continue;
        }
        let files: Vec<&str> = manifest.sample_files(id).iter().map(|f| f.path.as_str()).collect();
        samples.insert(id.clone(), json!({"files": files, "metadata": manifest.sample_metadata(id)}));
    }
    let global: Vec<&str> = manifest.files.global.iter().map(|f| f.path.as_str()).collect();
    log::debug!("manifest inspected path={path} samples={}", samples.len());
    let out = json!({"global": global, "samples": samples});
    println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
}

fn main() {
    // Cargar .env si existe (PIPEFLOW_*, RUST_LOG)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else { usage_error("falta el subcomando") };
    let rest = &args[2..];
    match command.as_str() {
        "simulate" => cmd_simulate(rest),
        "eval-runtime" => cmd_eval_runtime(rest),
        "inspect-manifest" => cmd_inspect_manifest(rest),
        "help" | "--help" | "-h" => println!("{USAGE}"),
        other => usage_error(&format!("subcomando desconocido: {other}")),
    }
}
