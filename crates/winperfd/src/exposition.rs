//! Prometheus text exposition format.
//!
//! Samples are grouped by descriptor in order of first appearance; every
//! group is preceded by its `# HELP` and `# TYPE` lines.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use tempfile::NamedTempFile;
use winperf_core::Sample;

/// Renders `samples` in the text format.
pub fn encode(samples: &[Sample]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&Sample>> = HashMap::new();
    for sample in samples {
        let name = sample.desc.fq_name();
        groups
            .entry(name)
            .or_insert_with(|| {
                order.push(name);
                Vec::new()
            })
            .push(sample);
    }

    let mut out = String::new();
    for name in order {
        let Some(group) = groups.get(name) else {
            continue;
        };
        let first = group[0];
        let _ = writeln!(out, "# HELP {} {}", name, escape_help(first.desc.help()));
        let _ = writeln!(out, "# TYPE {} {}", name, first.kind.as_str());
        for sample in group {
            out.push_str(name);
            write_labels(&mut out, sample);
            out.push(' ');
            out.push_str(&format_value(sample.value));
            out.push('\n');
        }
    }
    out
}

fn write_labels(out: &mut String, sample: &Sample) {
    let labels = sample.desc.labels();
    if labels.is_empty() {
        return;
    }
    out.push('{');
    for (i, (name, value)) in labels.iter().zip(&sample.label_values).enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}=\"{}\"", name, escape_label(value));
    }
    out.push('}');
}

fn escape_help(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{}", v)
    }
}

/// Replaces `path` with `body` atomically: readers see the old or the new
/// file, never a partial one.
pub fn write_textfile(path: &Path, body: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use winperf_core::metric::DescRegistry;
    use winperf_core::{Desc, ValueKind};

    fn sample(desc: &Arc<Desc>, kind: ValueKind, value: f64, labels: &[&str]) -> Sample {
        Sample {
            desc: Arc::clone(desc),
            kind,
            value,
            label_values: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn groups_samples_under_one_header() {
        let mut descs = DescRegistry::new();
        let thrown = descs
            .register(
                "windows_netframework_clrexceptions_exceptions_thrown_total".into(),
                "Displays the total number of exceptions thrown since the application started.",
                &["process"],
            )
            .unwrap();
        let up = descs.register("windows_up".into(), "Up.", &[]).unwrap();

        let text = encode(&[
            sample(&thrown, ValueKind::Counter, 120.0, &["w3wp"]),
            sample(&up, ValueKind::Gauge, 1.0, &[]),
            sample(&thrown, ValueKind::Counter, 4294967295.0, &["dotnet"]),
        ]);

        assert_eq!(
            text,
            "# HELP windows_netframework_clrexceptions_exceptions_thrown_total Displays the total number of exceptions thrown since the application started.\n\
             # TYPE windows_netframework_clrexceptions_exceptions_thrown_total counter\n\
             windows_netframework_clrexceptions_exceptions_thrown_total{process=\"w3wp\"} 120\n\
             windows_netframework_clrexceptions_exceptions_thrown_total{process=\"dotnet\"} 4294967295\n\
             # HELP windows_up Up.\n\
             # TYPE windows_up gauge\n\
             windows_up 1\n"
        );
    }

    #[test]
    fn escapes_label_values_and_help() {
        let mut descs = DescRegistry::new();
        let state = descs
            .register(
                "windows_scheduled_task_state".into(),
                "Line one\nback\\slash",
                &["task", "state"],
            )
            .unwrap();
        let text = encode(&[sample(
            &state,
            ValueKind::Gauge,
            0.0,
            &["/Odd \"quoted\"\\task\n", "ready"],
        )]);

        assert!(text.contains("# HELP windows_scheduled_task_state Line one\\nback\\\\slash\n"));
        assert!(text.contains(
            "windows_scheduled_task_state{task=\"/Odd \\\"quoted\\\"\\\\task\\n\",state=\"ready\"} 0\n"
        ));
    }

    #[test]
    fn special_values_use_prometheus_spelling() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_value(0.5), "0.5");
        assert_eq!(format_value(-3.0), "-3");
    }

    #[test]
    fn empty_scrape_encodes_to_nothing() {
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn textfile_is_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winperfd.prom");

        write_textfile(&path, "first 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first 1\n");

        write_textfile(&path, "second 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second 2\n");

        // No temporary files are left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn textfile_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("winperfd.prom");
        assert!(write_textfile(&path, "x 1\n").is_err());
    }
}
