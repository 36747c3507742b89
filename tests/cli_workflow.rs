use std::fs;
use std::process::{Command, Output};

use countfit::model::FittedModel;
use tempfile::tempdir;

fn run_countfit(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_countfit"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run countfit cli")
}

#[test]
fn evaluate_prints_the_deviance() {
    let tmp = tempdir().expect("temporary directory");
    let data_path = tmp.path().join("counts.tsv");
    fs::write(&data_path, "count\tx\n2\t-1.0\n5\t0.0\n3\t1.0\n").expect("write data");

    let output = run_countfit(
        tmp.path(),
        &["evaluate", "--data", data_path.to_str().expect("path str"), "--beta", "1,0,0"],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let printed: f64 = stdout.trim().parse().expect("numeric deviance");
    let expected = 3.0 * std::f64::consts::E - 10.0 + 2.0_f64.ln() + 120.0_f64.ln() + 6.0_f64.ln();
    assert!((printed - expected).abs() < 1e-9, "printed {printed}, expected {expected}");
}

#[test]
fn evaluate_accepts_negative_parameters_and_rejects_bad_counts() {
    let tmp = tempdir().expect("temporary directory");
    let good = tmp.path().join("good.tsv");
    fs::write(&good, "count\tx\n0\t0.5\n1\t-0.5\n").expect("write data");
    let output = run_countfit(
        tmp.path(),
        &["evaluate", "--data", good.to_str().expect("path str"), "--beta", "-0.5,-1.2,0.3"],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let bad = tmp.path().join("bad.tsv");
    fs::write(&bad, "count\tx\n1\t0.5\n-2\t-0.5\n").expect("write data");
    let output = run_countfit(
        tmp.path(),
        &["evaluate", "--data", bad.to_str().expect("path str"), "--beta", "0,0,0"],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
}

#[test]
fn simulate_fit_predict_round_trip() {
    let tmp = tempdir().expect("temporary directory");
    let output = run_countfit(
        tmp.path(),
        &[
            "simulate",
            "--scenario",
            "quadratic",
            "--n",
            "3000",
            "--seed",
            "5",
            "--out",
            "sim.tsv",
            "--spec-out",
            "model.toml",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(tmp.path().join("model.toml").exists());

    let output = run_countfit(
        tmp.path(),
        &[
            "fit", "--data", "sim.tsv", "--model", "model.toml", "--method", "bfgs", "--out",
            "fitted.toml",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("abundance:x^2"), "stdout: {stdout}");

    let fitted = FittedModel::load(&tmp.path().join("fitted.toml")).expect("load fitted model");
    assert_eq!(fitted.standardizations.len(), 1);
    assert_eq!(fitted.standardizations[0].covariate, "x");

    let output = run_countfit(
        tmp.path(),
        &[
            "predict", "--data", "sim.tsv", "--model", "fitted.toml", "--out", "pred.tsv",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let predictions = fs::read_to_string(tmp.path().join("pred.tsv")).expect("read predictions");
    let mut lines = predictions.lines();
    assert_eq!(lines.next(), Some("abundance_eta\tabundance_mean"));
    assert_eq!(lines.count(), 3000);
}

#[test]
fn non_convergence_exits_with_code_two() {
    let tmp = tempdir().expect("temporary directory");
    let output = run_countfit(
        tmp.path(),
        &["simulate", "--n", "500", "--out", "sim.tsv", "--spec-out", "model.toml"],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let output = run_countfit(
        tmp.path(),
        &[
            "fit",
            "--data",
            "sim.tsv",
            "--model",
            "model.toml",
            "--max-iterations",
            "1",
            "--restarts",
            "0",
        ],
    );
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("did not converge"), "stderr: {stderr}");
    assert!(!tmp.path().join("fitted.toml").exists());
}

#[test]
fn aggregate_bins_points_and_joins_covariates() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(
        tmp.path().join("points.tsv"),
        "x\ty\n0.5\t0.5\n0.7\t0.2\n1.5\t0.5\n1.2\t1.9\n5.0\t5.0\n",
    )
    .expect("write points");
    fs::write(
        tmp.path().join("cells.tsv"),
        "row\tcol\televation\n0\t0\t10\n0\t1\t20\n1\t0\t30\n1\t1\t40\n",
    )
    .expect("write cells");

    let output = run_countfit(
        tmp.path(),
        &[
            "aggregate",
            "--points",
            "points.tsv",
            "--covariates",
            "cells.tsv",
            "--covariate",
            "elevation",
            "--cell-size",
            "1",
            "--rows",
            "2",
            "--cols",
            "2",
            "--out",
            "counts.tsv",
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 outside the grid"), "stdout: {stdout}");
    assert!(stdout.contains("2x2 grid of 1-unit cells"), "stdout: {stdout}");
    assert!(stdout.contains("Wrote 4 cell records"), "stdout: {stdout}");

    let table = fs::read_to_string(tmp.path().join("counts.tsv")).expect("read counts");
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "count\televation");
    assert_eq!(lines.len(), 5);
    let total: f64 = lines[1..]
        .iter()
        .map(|l| l.split('\t').next().expect("count field").parse::<f64>().expect("count"))
        .sum();
    assert_eq!(total, 4.0);
}
