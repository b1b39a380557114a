// src/utils/html_debug.rs
use std::fs;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;

use crate::utils::error::AppError;

/// Wraps every case-insensitive occurrence of the given needles in a
/// highlighted `<mark>` so a dumped page shows where the scraper was looking.
pub fn annotate_html(html: &str, needles: &[String]) -> Result<String, AppError> {
    let mut highlights: Vec<(usize, usize, usize)> = Vec::new();

    for (idx, needle) in needles.iter().enumerate() {
        if needle.trim().is_empty() {
            continue;
        }
        let re = RegexBuilder::new(&regex::escape(needle))
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::Config(format!("Invalid highlight pattern '{}': {}", needle, e)))?;
        for mat in re.find_iter(html) {
            highlights.push((mat.start(), mat.end(), idx));
        }
    }

    // Overlapping matches keep the earliest one.
    highlights.sort_by_key(|h| (h.0, std::cmp::Reverse(h.1)));

    let mut out = String::with_capacity(html.len() + highlights.len() * 64);
    out.push_str("<!-- annotated debug dump -->\n<style>mark.dbg { background-color: #FFFF00; }</style>\n");
    let mut last_pos = 0;
    for (start, end, idx) in highlights {
        if start < last_pos {
            continue;
        }
        out.push_str(&html[last_pos..start]);
        out.push_str(&format!(
            "<mark class=\"dbg\" title=\"{}\">",
            needles[idx].replace('"', "&quot;")
        ));
        out.push_str(&html[start..end]);
        out.push_str("</mark>");
        last_pos = end;
    }
    out.push_str(&html[last_pos..]);

    Ok(out)
}

/// Writes a screenshot and an annotated HTML snapshot into `dir`,
/// named after `tag`. Returns the paths written.
pub fn save_page_dump(
    dir: &Path,
    tag: &str,
    screenshot: Option<&[u8]>,
    html: Option<&str>,
    needles: &[String],
) -> Result<Vec<PathBuf>, AppError> {
    fs::create_dir_all(dir)?;
    let stem = sanitize_tag(tag);
    let mut written = Vec::new();

    if let Some(png) = screenshot {
        let path = dir.join(format!("{}.png", stem));
        fs::write(&path, png)?;
        written.push(path);
    }

    if let Some(html) = html {
        let path = dir.join(format!("{}.html", stem));
        fs::write(&path, annotate_html(html, needles)?)?;
        written.push(path);
    }

    for path in &written {
        tracing::info!("Saved debug dump to {}", path.display());
    }
    Ok(written)
}

fn sanitize_tag(tag: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let cleaned: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}", stamp, cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_marks_case_insensitive_matches() {
        let html = "<div>q1 2023</div><a>Transcript</a>";
        let out = annotate_html(html, &["Q1 2023".to_string(), "transcript".to_string()]).unwrap();
        assert!(out.contains("<mark class=\"dbg\" title=\"Q1 2023\">q1 2023</mark>"));
        assert!(out.contains("<mark class=\"dbg\" title=\"transcript\">Transcript</mark>"));
    }

    #[test]
    fn test_annotate_skips_overlaps() {
        let html = "Press Release";
        let out = annotate_html(html, &["Press Release".to_string(), "Release".to_string()]).unwrap();
        assert_eq!(out.matches("<mark").count(), 1);
    }

    #[test]
    fn test_save_page_dump_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let written = save_page_dump(
            dir.path(),
            "AAPL Q1/2023",
            Some(b"\x89PNG"),
            Some("<p>Q1 2023</p>"),
            &["Q1 2023".to_string()],
        )
        .unwrap();
        assert_eq!(written.len(), 2);
        for path in &written {
            assert!(path.exists());
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.ends_with("AAPL_Q1_2023.png") || name.ends_with("AAPL_Q1_2023.html"));
        }
    }
}
