//! Compile a ZIL source file into a Z-machine story file.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;

use zilc_codegen::{compile, Options};
use zilc_frontend::preprocess::SourceLoader;
use zilc_zmachine::ZVersion;

/// Compile ZIL source into a Z-machine story file.
#[derive(Parser)]
#[command(name = "zilc", version, about)]
pub struct CompileCommand {
    /// The ZIL source file.
    source: PathBuf,

    /// Output file; defaults to the source name with a `.z<N>` suffix.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target version: 3-8 or ZIP/EZIP/XZIP/YZIP. A `<VERSION …>` form
    /// in the source takes precedence.
    #[arg(id = "zversion", short = 'v', long = "zversion")]
    version: Option<ZVersion>,

    /// Release number stored in the header.
    #[arg(long, default_value_t = 1)]
    release: u16,

    /// Serial number (six digits, YYMMDD). Fixed by default so output
    /// is reproducible.
    #[arg(long)]
    serial: Option<String>,

    /// Abort after this many warnings.
    #[arg(short = 'W', long, default_value_t = 100)]
    warning_limit: usize,
}

/// Resolves `INSERT-FILE` names relative to the main source's
/// directory, trying the bare name and a `.zil` suffix.
struct FileLoader {
    root: PathBuf,
}

impl SourceLoader for FileLoader {
    fn load(&mut self, name: &str) -> Result<String, String> {
        let candidates = [
            name.to_owned(),
            format!("{name}.zil"),
            name.to_ascii_lowercase(),
            format!("{}.zil", name.to_ascii_lowercase()),
        ];
        for cand in &candidates {
            let path = self.root.join(cand);
            if path.is_file() {
                debug!("include \"{name}\" -> {}", path.display());
                return fs::read_to_string(&path).map_err(|e| e.to_string());
            }
        }
        Err(format!("not found under {}", self.root.display()))
    }
}

impl CompileCommand {
    pub fn execute(self) -> Result<()> {
        let source = fs::read_to_string(&self.source)
            .with_context(|| format!("cannot read {}", self.source.display()))?;
        let root = self
            .source
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut loader = FileLoader { root };

        let serial = match &self.serial {
            None => None,
            Some(s) => {
                let bytes = s.as_bytes();
                if bytes.len() != 6 || !bytes.iter().all(u8::is_ascii_digit) {
                    bail!("--serial must be six digits (YYMMDD)");
                }
                Some(<[u8; 6]>::try_from(bytes).unwrap())
            }
        };
        let options = Options {
            version: self.version,
            release: self.release,
            serial,
            warning_limit: self.warning_limit,
        };

        let file_name = self.source.display().to_string();
        let output = match compile(&file_name, &source, &mut loader, &options) {
            Ok(output) => output,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
        for w in &output.warnings {
            eprintln!("{w}");
        }

        let out_path = self.output.unwrap_or_else(|| {
            self.source.with_extension(format!("z{}", output.version.number()))
        });
        // The image is complete and verified; one write, no partial
        // files on failure.
        fs::write(&out_path, &output.image)
            .with_context(|| format!("cannot write {}", out_path.display()))?;
        eprintln!(
            "{}: {} bytes ({})",
            out_path.display(),
            output.image.len(),
            output.version
        );
        Ok(())
    }
}
