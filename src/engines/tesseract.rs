//! Secondary recognizer backed by the `tesseract` binary.
//!
//! The crop is handed over as a temporary PNG and read back as TSV so we
//! get per-word confidences. PSM hints map to `--psm 7` (single line) and
//! `--psm 6` (uniform block).

use std::path::PathBuf;
use std::process::Command;

use anyhow::Context;
use image::GrayImage;

use super::{OcrLines, PsmHint, SecondaryOcr};

#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: PathBuf,
    lang: String,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<PathBuf>, lang: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            lang: lang.into(),
        }
    }

    /// Probe the PATH for a usable binary.
    pub fn discover() -> Option<Self> {
        let candidate = Self::new("tesseract", "eng");
        if candidate.available() {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl SecondaryOcr for TesseractOcr {
    fn recognize(&self, image: &GrayImage, psm: PsmHint) -> anyhow::Result<OcrLines> {
        let tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .context("creating temp image for tesseract")?;
        image
            .save(tmp.path())
            .context("writing crop for tesseract")?;

        let output = Command::new(&self.binary)
            .arg(tmp.path())
            .arg("stdout")
            .arg("--psm")
            .arg(psm.tesseract_mode().to_string())
            .arg("-l")
            .arg(&self.lang)
            .arg("tsv")
            .output()
            .context("spawning tesseract")?;
        if !output.status.success() {
            anyhow::bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse tesseract TSV output into joined text and a mean word confidence
/// in `[0, 1]`.
fn parse_tsv(tsv: &str) -> OcrLines {
    const WORD_LEVEL: &str = "5";

    let mut lines: Vec<Vec<&str>> = Vec::new();
    let mut confidences: Vec<f32> = Vec::new();
    let mut last_line_key: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != WORD_LEVEL {
            continue;
        }
        let conf: f32 = match cols[10].parse() {
            Ok(c) if c >= 0.0 => c,
            _ => continue,
        };
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        if last_line_key != Some(key) {
            lines.push(Vec::new());
            last_line_key = Some(key);
        }
        lines.last_mut().unwrap().push(word);
        confidences.push(conf / 100.0);
    }

    let text = lines
        .iter()
        .map(|words| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };

    OcrLines { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t200\t100\t-1\t\n\
5\t1\t1\t1\t1\t1\t10\t5\t40\t12\t91\tWidget\n\
5\t1\t1\t1\t1\t2\t55\t5\t10\t12\t88\tA\n\
5\t1\t1\t1\t2\t1\t10\t20\t30\t12\t95\t£50.00\n\
5\t1\t1\t1\t2\t2\t45\t20\t30\t12\t-1\t\n";

    #[test]
    fn tsv_words_join_into_lines() {
        let parsed = parse_tsv(SAMPLE_TSV);
        assert_eq!(parsed.text, "Widget A\n£50.00");
        let expected = (0.91 + 0.88 + 0.95) / 3.0;
        assert!((parsed.confidence - expected).abs() < 1e-4);
    }

    #[test]
    fn empty_tsv_is_zero_confidence() {
        let parsed = parse_tsv("level\tpage_num\n");
        assert_eq!(parsed.text, "");
        assert_eq!(parsed.confidence, 0.0);
    }

    #[test]
    fn psm_hints_map_to_modes() {
        assert_eq!(PsmHint::SingleLine.tesseract_mode(), 7);
        assert_eq!(PsmHint::UniformBlock.tesseract_mode(), 6);
    }
}
