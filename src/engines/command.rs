//! External-process engine adapters.
//!
//! `CommandOcr` drives a recognizer process: the crop is written to a
//! temporary PNG, the process receives its path and prints a JSON payload
//! (any shape `adapter` tolerates) on stdout. `CommandDonut` and
//! `CommandHtr` do the same for the Donut and handwriting contracts. This
//! keeps heavyweight Python/ONNX recognizers out of the host process
//! while the pipeline stays synchronous.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use image::GrayImage;
use serde::Deserialize;

use super::{DonutClient, DonutResponse, HtrClient, OcrLines, PrimaryOcr};

#[derive(Debug, Clone)]
pub struct CommandOcr {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandOcr {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn available(&self) -> bool {
        which_like(&self.program)
    }
}

impl PrimaryOcr for CommandOcr {
    fn recognize(&self, image: &GrayImage, orient: bool) -> anyhow::Result<serde_json::Value> {
        let tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .context("creating temp image for recognizer")?;
        image
            .save(tmp.path())
            .context("writing crop for recognizer")?;

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if orient {
            command.arg("--orient");
        }
        command.arg(tmp.path());

        let output = command.output().context("spawning recognizer process")?;
        if !output.status.success() {
            anyhow::bail!(
                "recognizer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout).context("recognizer printed invalid JSON")
    }
}

#[derive(Debug, Clone)]
pub struct CommandDonut {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDonut {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn available(&self) -> bool {
        which_like(&self.program)
    }
}

impl DonutClient for CommandDonut {
    fn parse(&self, image_path: &Path) -> DonutResponse {
        let output = match Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()
        {
            Ok(output) => output,
            Err(e) => return DonutResponse::unavailable(format!("spawn failed: {e}")),
        };
        if !output.status.success() {
            return DonutResponse {
                status: super::DonutStatus::Error,
                text: None,
                model: None,
                error: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            };
        }
        match serde_json::from_slice(&output.stdout) {
            Ok(response) => response,
            Err(e) => DonutResponse {
                status: super::DonutStatus::Error,
                text: None,
                model: None,
                error: Some(format!("invalid response JSON: {e}")),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandHtr {
    program: PathBuf,
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HtrOutput {
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl CommandHtr {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn available(&self) -> bool {
        which_like(&self.program)
    }
}

impl HtrClient for CommandHtr {
    fn transcribe(&self, image: &GrayImage) -> anyhow::Result<OcrLines> {
        let tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .context("creating temp image for transcriber")?;
        image
            .save(tmp.path())
            .context("writing crop for transcriber")?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(tmp.path())
            .output()
            .context("spawning transcriber process")?;
        if !output.status.success() {
            anyhow::bail!(
                "transcriber exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let parsed: HtrOutput =
            serde_json::from_slice(&output.stdout).context("transcriber printed invalid JSON")?;
        Ok(OcrLines {
            text: parsed.text,
            confidence: parsed.confidence,
        })
    }
}

/// Existence probe: absolute paths are checked directly, bare names are
/// resolved against PATH.
fn which_like(program: &Path) -> bool {
    if program.is_absolute() {
        return program.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(program).exists())
}
