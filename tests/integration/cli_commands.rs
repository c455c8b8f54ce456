#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use spindle::query::{Expr, PlanBuilder};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    plan: PathBuf,
    data: PathBuf,
    options: PathBuf,
}

/// Writes a subquery plan over `users`, a 30-document dataset and an options file.
fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tempdir");

    let mut b = PlanBuilder::new();
    let x = b
        .subquery("x", |s| {
            let u = s.for_collection("u", "users")?;
            s.filter(Expr::eq(Expr::var(u).attr("team"), Expr::lit(1i64)))?;
            s.return_(Expr::var(u).attr("n"))
        })
        .expect("subquery");
    let n = b.for_in("n", Expr::var(x)).expect("for");
    b.limit(2, 3).expect("limit");
    b.return_(Expr::var(n)).expect("return");
    let plan = b.build().expect("plan");

    let docs: Vec<Value> = (0..30).map(|n| json!({ "n": n, "team": n % 3 })).collect();
    let dataset = json!({
        "collections": { "users": docs },
        "indexes": [{ "collection": "users", "name": "idx_team", "field": "team" }],
    });

    let plan_path = dir.path().join("plan.json");
    let data_path = dir.path().join("data.json");
    let options_path = dir.path().join("options.toml");
    fs::write(&plan_path, serde_json::to_string(&plan).expect("serialize plan"))
        .expect("write plan");
    fs::write(&data_path, dataset.to_string()).expect("write data");
    fs::write(&options_path, "batch_size = 2\n\n[optimizer]\nrules = [\"-use-indexes\"]\n")
        .expect("write options");

    Fixture {
        _dir: dir,
        plan: plan_path,
        data: data_path,
        options: options_path,
    }
}

fn stdout_json(output: Vec<u8>) -> Value {
    serde_json::from_slice(&output).expect("valid json")
}

fn node_types(explain: &Value) -> Vec<String> {
    explain["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .filter_map(|node| node["type"].as_str().map(str::to_owned))
        .collect()
}

#[test]
fn explain_prints_the_rewritten_plan() {
    let fx = fixture();
    let output = cargo_bin_cmd!("spindle")
        .args(["explain", "--plan"])
        .arg(&fx.plan)
        .arg("--data")
        .arg(&fx.data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let explain = stdout_json(output);
    assert_eq!(explain["rules"], json!(["inline-subqueries", "use-indexes"]));
    assert!(!node_types(&explain).contains(&"SubqueryNode".to_owned()));
    assert!(node_types(&explain).contains(&"IndexNode".to_owned()));
    assert!(explain["planHash"].as_str().is_some_and(|hash| hash.len() == 16));
}

#[test]
fn explain_raw_skips_every_rule() {
    let fx = fixture();
    let output = cargo_bin_cmd!("spindle")
        .args(["explain", "--raw", "--plan"])
        .arg(&fx.plan)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let explain = stdout_json(output);
    assert_eq!(explain["rules"], json!([]));
    assert_eq!(node_types(&explain)[1], "SubqueryNode");
}

#[test]
fn rule_toggles_disable_rewrites() {
    let fx = fixture();
    let output = cargo_bin_cmd!("spindle")
        .args(["explain", "--rules=-all", "--plan"])
        .arg(&fx.plan)
        .arg("--data")
        .arg(&fx.data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let explain = stdout_json(output);
    assert_eq!(explain["rules"], json!([]));
    assert!(node_types(&explain).contains(&"SubqueryNode".to_owned()));
}

#[test]
fn run_reports_rows_and_full_count() {
    let fx = fixture();
    let output = cargo_bin_cmd!("spindle")
        .args(["run", "--full-count", "--plan"])
        .arg(&fx.plan)
        .arg("--data")
        .arg(&fx.data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = stdout_json(output);
    assert_eq!(result["rows"], json!([7, 10, 13]));
    assert_eq!(result["stats"]["fullCount"], json!(10));
    assert_eq!(result["stats"]["scannedIndex"], json!(10));
}

#[test]
fn options_file_is_honoured() {
    let fx = fixture();
    let output = cargo_bin_cmd!("spindle")
        .args(["run", "--plan"])
        .arg(&fx.plan)
        .arg("--data")
        .arg(&fx.data)
        .arg("--options")
        .arg(&fx.options)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = stdout_json(output);
    assert_eq!(result["rows"], json!([7, 10, 13]));
    assert_eq!(result["stats"]["scannedIndex"], json!(0));
    assert_eq!(result["stats"]["fullCount"], json!(0));
}

#[test]
fn missing_plan_file_fails() {
    let fx = fixture();
    cargo_bin_cmd!("spindle")
        .args(["run", "--plan", "does-not-exist.json", "--data"])
        .arg(&fx.data)
        .assert()
        .failure();
}
