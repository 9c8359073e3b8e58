//! OpenALPR command-line backend.
//!
//! Each recognition spawns the engine's `alpr` binary, streams the frame to
//! it as JPEG on stdin (`alpr ... -j -`) and parses the JSON it prints.
//! The binary only searches whole images, so the regions passed in are
//! recorded in the result but not forwarded.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::frame::{Frame, RegionOfInterest};
use crate::recognize::backend::PlateRecognizer;
use crate::recognize::result::RecognitionResult;

/// Configuration for the OpenALPR command-line engine.
#[derive(Clone, Debug)]
pub struct OpenAlprConfig {
    /// Path or name of the `alpr` executable.
    pub binary: PathBuf,
    /// Country code, e.g. "eu" or "us".
    pub country: String,
    /// Engine configuration file (openalpr.conf).
    pub config_file: PathBuf,
    /// Number of candidates to request per plate.
    pub top_n: u32,
    /// Region pattern to match plates against (e.g. "es").
    pub default_region: Option<String>,
}

impl Default for OpenAlprConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("alpr"),
            country: "eu".to_string(),
            config_file: PathBuf::from("runtime_data/eu.conf"),
            top_n: 10,
            default_region: None,
        }
    }
}

pub struct OpenAlprCli {
    config: OpenAlprConfig,
}

impl OpenAlprCli {
    pub const NAME: &'static str = "openalpr-cli";

    pub fn new(config: OpenAlprConfig) -> Self {
        Self { config }
    }

    /// Engine arguments, excluding the trailing image argument.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.config.country.clone(),
            "--config".to_string(),
            self.config.config_file.display().to_string(),
            "-n".to_string(),
            self.config.top_n.to_string(),
        ];
        if let Some(region) = &self.config.default_region {
            args.push("-p".to_string());
            args.push(region.clone());
        }
        args.push("-j".to_string());
        args
    }
}

impl PlateRecognizer for OpenAlprCli {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn warm_up(&mut self) -> Result<()> {
        if !self.config.config_file.is_file() {
            return Err(anyhow!(
                "engine configuration {} not found",
                self.config.config_file.display()
            ));
        }
        let status = Command::new(&self.config.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("run {} --version", self.config.binary.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "{} --version exited with {}",
                self.config.binary.display(),
                status
            ));
        }
        log::info!(
            "OpenAlprCli: engine {} ready (country={}, config={})",
            self.config.binary.display(),
            self.config.country,
            self.config.config_file.display()
        );
        Ok(())
    }

    fn recognize(
        &mut self,
        frame: &Frame,
        regions: &[RegionOfInterest],
    ) -> Result<RecognitionResult> {
        let jpeg = frame.encode_jpeg()?;
        let started = Instant::now();

        let mut child = Command::new(&self.config.binary)
            .args(self.args())
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.config.binary.display()))?;
        // stdin is closed before waiting; the child is reaped even when the
        // write fails because the engine quit without reading the frame.
        let written = child.stdin.take().map(|mut stdin| stdin.write_all(&jpeg));
        let output = child.wait_with_output().context("wait for engine")?;
        if !output.status.success() {
            return Err(anyhow!(
                "engine exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        match written {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(anyhow::Error::new(err).context("send frame to engine")),
            None => return Err(anyhow!("engine stdin unavailable")),
        }

        let mut result = parse_results(&String::from_utf8_lossy(&output.stdout))?;
        if result.img_width == 0 || result.img_height == 0 {
            result.img_width = frame.width;
            result.img_height = frame.height;
        }
        if result.regions_of_interest.is_empty() {
            result.regions_of_interest = regions.to_vec();
        }
        log::debug!(
            "OpenAlprCli: round trip {:.1} ms, engine reported {:.1} ms",
            started.elapsed().as_secs_f64() * 1000.0,
            result.processing_time_ms
        );
        Ok(result)
    }
}

/// Parse the engine's `-j` output: the first line that holds a JSON object.
pub fn parse_results(output: &str) -> Result<RecognitionResult> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .ok_or_else(|| anyhow!("engine produced no JSON output"))?;
    serde_json::from_str(line).context("parse engine JSON output")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGINE_OUTPUT: &str = r#"{"version":2,"data_type":"alpr_results","epoch_time":1700000000000,"img_width":640,"img_height":480,"processing_time_ms":41.2,"regions_of_interest":[],"results":[{"plate":"1234BCD","confidence":90.1,"matches_template":1,"plate_index":0,"region":"es","region_confidence":87,"processing_time_ms":12.5,"requested_topn":10,"coordinates":[{"x":10,"y":20},{"x":110,"y":20},{"x":110,"y":45},{"x":10,"y":45}],"candidates":[{"plate":"1234BCD","confidence":90.1,"matches_template":1},{"plate":"1234BC0","confidence":80.4,"matches_template":0}]}]}"#;

    #[test]
    fn args_include_country_config_and_topn() {
        let cli = OpenAlprCli::new(OpenAlprConfig {
            default_region: Some("es".to_string()),
            ..OpenAlprConfig::default()
        });
        assert_eq!(
            cli.args(),
            vec!["-c", "eu", "--config", "runtime_data/eu.conf", "-n", "10", "-p", "es", "-j"]
        );
    }

    #[test]
    fn parses_engine_json() -> Result<()> {
        let output = format!("{}\n", ENGINE_OUTPUT);
        let result = parse_results(&output)?;
        assert_eq!(result.img_width, 640);
        assert_eq!(result.plates.len(), 1);

        let plate = &result.plates[0];
        assert_eq!(plate.region(), Some("es"));
        assert_eq!(plate.coordinates.len(), 4);
        assert_eq!(plate.candidates.len(), 2);
        assert!(plate.candidates[0].matches_template);
        assert!(!plate.candidates[1].matches_template);
        Ok(())
    }

    #[test]
    fn skips_non_json_preamble() -> Result<()> {
        let output = format!("Loading runtime data...\n{}\n", ENGINE_OUTPUT);
        assert_eq!(parse_results(&output)?.plates[0].plate, "1234BCD");
        Ok(())
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(parse_results("No license plates found.\n").is_err());
        assert!(parse_results("{not json").is_err());
    }

    #[test]
    fn warm_up_requires_config_file() {
        let mut cli = OpenAlprCli::new(OpenAlprConfig {
            config_file: PathBuf::from("/nonexistent/openalpr.conf"),
            ..OpenAlprConfig::default()
        });
        let err = cli.warm_up().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
