use anyhow::Result;
use harvest::config::{FetchMode, load_job_file};
use harvest::pipeline::{run_job, validate_jobs};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

#[test]
fn file_mode_job_exports_json() -> Result<()> {
    let mut job = load_job_file(&fixture_root().join("jobs/shop.toml"))?;
    assert_eq!(job.config.fetch.mode, FetchMode::File);

    let out = tempdir()?;
    job.config.export.output_dir = out.path().to_path_buf();

    let report = run_job(&job)?;
    assert_eq!(report.job, "fixture-shop");
    assert_eq!(report.urls, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.records, 3);

    let output = PathBuf::from(report.output.expect("records exported"));
    assert_eq!(output, out.path().join("shop.json"));

    let rows: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert_eq!(rows[0]["title"], "Sample");
    assert_eq!(rows[0]["price"], "10");
    assert_eq!(rows[0]["link"], "/products/sample");
    assert_eq!(rows[1]["price"], "24.50");
    assert!(rows[2]["price"].is_null());
    assert!(rows[2].get("source_url").is_none());
    Ok(())
}

#[test]
fn inline_job_in_meta_mode() -> Result<()> {
    let dir = tempdir()?;
    let out = dir.path().join("out");
    let job_path = dir.path().join("meta.toml");
    fs::write(
        &job_path,
        format!(
            r#"
[job]
name = "inline-meta"

[fetch]
mode = "inline"
inline_data = '<html><head><title>Inline</title><meta property="og:title" content="OG"></head></html>'

[extract]
mode = "meta"

[export]
output_dir = "{}"
filename = "meta"
format = "csv"
"#,
            out.display().to_string().replace('\\', "/")
        ),
    )?;

    let job = load_job_file(&job_path)?;
    let report = run_job(&job)?;
    assert_eq!(report.records, 1);

    let text = fs::read_to_string(out.join("meta.csv"))?;
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(
        lines[0],
        "title,description,keywords,author,og_title,og_description,og_image"
    );
    assert_eq!(lines[1], "Inline,,,,OG,,");
    Ok(())
}

#[test]
fn validate_reports_every_job_in_a_directory() -> Result<()> {
    let lines = validate_jobs(&fixture_root().join("jobs"))?;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("OK: fixture-shop"));
    Ok(())
}

#[test]
fn invalid_job_names_the_file() -> Result<()> {
    let dir = tempdir()?;
    let job_path = dir.path().join("broken.toml");
    fs::write(
        &job_path,
        "urls = [\"not a url\"]\n\n[job]\nname = \"broken\"\n",
    )?;

    let err = load_job_file(&job_path).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("broken.toml"));
    assert!(message.contains("invalid url"));
    Ok(())
}

fn fixture_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}
