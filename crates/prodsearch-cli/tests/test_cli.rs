use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

const CORPUS: &str = r#"{"reviewerID": "u1", "asin": "case", "reviewText": "slim red phone case", "unixReviewTime": 1, "queries": ["phone case"]}
{"reviewerID": "u1", "asin": "charger", "reviewText": "fast phone charger", "unixReviewTime": 2, "queries": ["phone charger"]}
{"reviewerID": "u1", "asin": "cable", "reviewText": "braided usb cable", "unixReviewTime": 3, "queries": ["usb cable"]}
{"reviewerID": "u2", "asin": "case", "reviewText": "tough phone case", "unixReviewTime": 1, "queries": ["phone case"]}
{"reviewerID": "u2", "asin": "cable", "reviewText": "short usb cable", "unixReviewTime": 2, "queries": ["usb cable"]}

{"reviewerID": "u2", "asin": "charger", "reviewText": "compact charger", "unixReviewTime": 3, "queries": ["phone charger"]}
{"reviewerID": "u3", "asin": "pan", "reviewText": "heavy iron pan", "unixReviewTime": 1, "queries": ["frying pan"]}
{"reviewerID": "u3", "asin": "knife", "reviewText": "sharp chef knife", "unixReviewTime": 2, "queries": ["kitchen knife"]}
{"reviewerID": "u3", "asin": "kettle", "reviewText": "quiet electric kettle", "unixReviewTime": 3, "queries": ["electric kettle"]}
{"reviewerID": "u4", "asin": "knife", "reviewText": "bread knife", "unixReviewTime": 1, "queries": ["kitchen knife"]}
{"reviewerID": "u4", "asin": "pan", "reviewText": "nonstick pan", "unixReviewTime": 2, "queries": ["frying pan"]}
"#;

fn write_corpus(dir: &Path) -> PathBuf {
    let path = dir.join("reviews.jsonl");
    fs::write(&path, CORPUS).unwrap();
    path
}

fn prodsearch() -> Command {
    Command::cargo_bin("prodsearch").unwrap()
}

fn train(input: &Path, model: &str, save: &Path) {
    prodsearch()
        .args(["train"])
        .arg(input)
        .args(["--model", model])
        .args(["--epochs", "2", "--batch-size", "4", "--neg-sample-num", "2"])
        .args(["--embedding-size", "8", "--head-num", "2", "--convolution-num", "1"])
        .args(["--top-k", "3", "--save"])
        .arg(save)
        .assert()
        .success()
        .stdout(predicate::str::contains("MRR@3:"))
        .stdout(predicate::str::contains("Saved checkpoint"));
}

#[test]
fn test_cli_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = write_corpus(dir.path());

    prodsearch()
        .arg("stats")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("Users:          4"))
        .stdout(predicate::str::contains("Items:          6"))
        .stdout(predicate::str::contains("Test:           4"))
        .stdout(predicate::str::contains("Train:          7"));
    Ok(())
}

#[test]
fn test_cli_stats_min_user_purchases() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = write_corpus(dir.path());

    // only u1, u2 and u3 bought three distinct items
    prodsearch()
        .arg("stats")
        .arg(&input)
        .args(["--min-user-purchases", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Test:           3"))
        .stdout(predicate::str::contains("entity->entity:purchased"));

    prodsearch()
        .arg("stats")
        .arg(&input)
        .args(["--min-user-purchases", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("min_user_purchases must be at least 2"));
    Ok(())
}

#[test]
fn test_cli_train_and_evaluate_graph_search() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = write_corpus(dir.path());
    let ckpt = dir.path().join("ckpt");
    train(&input, "graph-search", &ckpt);

    assert!(ckpt.join("model.safetensors").exists());
    let meta: serde_json::Value = serde_json::from_str(&fs::read_to_string(ckpt.join("meta.json"))?)?;
    assert_eq!(meta["model"]["model"], "graph_search");
    assert_eq!(meta["model"]["word_embedding_size"], 8);
    assert_eq!(meta["epochs"], 2);

    prodsearch()
        .arg("evaluate")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&ckpt)
        .args(["--top-k", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("graph_search (2 epochs)"))
        .stdout(predicate::str::contains("MRR@5:"))
        .stdout(predicate::str::contains("(n=4)"));
    Ok(())
}

#[test]
fn test_cli_similar_users() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = write_corpus(dir.path());
    let ckpt = dir.path().join("ckpt");
    train(&input, "graph-search", &ckpt);

    let output = prodsearch()
        .arg("similar-users")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&ckpt)
        .args(["--top", "2"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 4);
    for line in &lines {
        let similar = line["similar"].as_array().unwrap();
        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|s| s["user"] != line["user"]));
    }
    Ok(())
}

#[test]
fn test_cli_similar_users_rejects_lse() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = write_corpus(dir.path());
    let ckpt = dir.path().join("lse");
    train(&input, "lse", &ckpt);

    prodsearch()
        .arg("similar-users")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&ckpt)
        .assert()
        .failure()
        .stderr(predicate::str::contains("graph_search checkpoint"));
    Ok(())
}

#[test]
fn test_cli_missing_input() {
    prodsearch()
        .args(["stats", "does/not/exist.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
}
