use std::path::PathBuf;

use clap::Parser;
use oneembed_cli::commands::{load_options, InspectCommand};
use oneembed_cli::{BenchCommand, Cli, Commands, OptionOverrides};
use oneembed_core::{CacheOptions, EmbeddingOptions, LearningRateScheduleOptions};

fn bench(dir: PathBuf) -> BenchCommand {
    BenchCommand {
        options: None,
        overrides: OptionOverrides::default(),
        dir: Some(dir),
        batches: 5,
        batch_size: 32,
        key_space: 50,
        seed: 7,
    }
}

fn small_options(dir: &std::path::Path) -> EmbeddingOptions {
    let mut options = EmbeddingOptions::new("bench", 4, dir);
    options.l1_cache = CacheOptions::lru(1);
    options.learning_rate_schedule = LearningRateScheduleOptions::constant(0.1);
    options
}

#[test]
fn test_parse_subcommands() {
    let cli = Cli::try_parse_from([
        "oneembed",
        "inspect",
        "/data/table",
        "--key",
        "-7",
        "--key",
        "42",
    ])
    .unwrap();
    match cli.command {
        Commands::Inspect(cmd) => {
            assert_eq!(cmd.table_dir, PathBuf::from("/data/table"));
            assert_eq!(cmd.keys, vec![-7, 42]);
        }
        other => panic!("unexpected command {other:?}"),
    }

    let cli = Cli::try_parse_from(["oneembed", "bench", "--batches", "3"]).unwrap();
    match cli.command {
        Commands::Bench(cmd) => {
            assert_eq!(cmd.batches, 3);
            assert_eq!(cmd.batch_size, 1024);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_load_options_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.json");
    let options = small_options(&dir.path().join("table"));
    std::fs::write(&path, options.to_json().unwrap()).unwrap();

    let loaded = load_options(&path, &OptionOverrides::default()).unwrap();
    assert_eq!(loaded, options);

    std::fs::write(&path, "{\"embedding_name\": \"x\"}").unwrap();
    assert!(load_options(&path, &OptionOverrides::default()).is_err());
}

#[test]
fn test_bench_then_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let table_dir = dir.path().join("table");
    let cmd = bench(table_dir.clone());

    let report = cmd.execute(small_options(&table_dir)).unwrap();
    assert_eq!(report.batches, 5);
    assert_eq!(report.global_step, 5);
    assert_eq!(report.stats.lookups, 5);
    assert_eq!(report.stats.updates, 5);
    assert!(report.stats.keys_looked_up > 0);
    assert!(report.to_string().contains("global_step: 5"));

    let inspect = InspectCommand {
        table_dir,
        keys: vec![-1],
        max_values: 2,
    };
    let text = inspect.describe().unwrap();
    assert!(text.contains("embedding_name: bench"), "{text}");
    assert!(text.contains("last_step: 5"), "{text}");
    assert!(text.contains("key -1: not stored"), "{text}");
}

#[test]
fn test_inspect_missing_table() {
    let dir = tempfile::tempdir().unwrap();
    let inspect = InspectCommand {
        table_dir: dir.path().join("absent"),
        keys: Vec::new(),
        max_values: 8,
    };
    assert!(inspect.describe().is_err());
}
