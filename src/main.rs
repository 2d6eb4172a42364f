use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use ledgerlens::artifacts::FsArtifactSink;
use ledgerlens::config::{DateOrder, PipelineConfig};
use ledgerlens::engines::command::{CommandDonut, CommandHtr, CommandOcr};
use ledgerlens::engines::ollama::OllamaClient;
use ledgerlens::engines::tesseract::TesseractOcr;
use ledgerlens::engines::EngineBundle;
use ledgerlens::layout::model::{OrtConfig, OrtExecutionProvider, OrtLayoutModel};
use ledgerlens::{readiness, ScanPipeline, Status};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DateOrderArg {
    DayFirst,
    MonthFirst,
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "ledgerlens - offline invoice & receipt understanding pipeline",
    long_about = "Converts scanned invoices, receipts and delivery notes (PDF or raster) \
into a structured, validated invoice card with line items, totals and per-field confidences."
)]
struct Args {
    /// Path to the PDF or image to process
    file_path: PathBuf,

    /// Root directory for artifacts (per-document folders are created under it)
    #[arg(long, env = "LEDGERLENS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to the ONNX layout model; without it the heuristic layout
    /// fallback is used
    #[arg(long, env = "LEDGERLENS_LAYOUT_MODEL")]
    layout_model: Option<PathBuf>,

    /// External primary recognizer command (receives a PNG path, prints JSON)
    #[arg(long, env = "LEDGERLENS_OCR_COMMAND")]
    ocr_command: Option<PathBuf>,

    /// External Donut fallback command (receives an image path, prints JSON)
    #[arg(long, env = "LEDGERLENS_DONUT_COMMAND")]
    donut_command: Option<PathBuf>,

    /// External handwriting transcriber command (receives a PNG crop,
    /// prints {"text", "confidence"} JSON)
    #[arg(long, env = "LEDGERLENS_HTR_COMMAND")]
    htr_command: Option<PathBuf>,

    /// Ollama endpoint for the LLM normalizer (e.g. http://localhost:11434)
    #[arg(long, env = "LEDGERLENS_LLM_URL")]
    llm_url: Option<String>,

    /// Model name for the LLM normalizer
    #[arg(long, env = "LEDGERLENS_LLM_MODEL", default_value = "llama3.1:8b")]
    llm_model: String,

    /// Supplier templates JSON file
    #[arg(long, env = "LEDGERLENS_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Target rendering density for PDF pages
    #[arg(long, default_value_t = 200)]
    dpi: u32,

    #[arg(long, value_enum, default_value_t = DateOrderArg::DayFirst)]
    date_order: DateOrderArg,

    /// Disable perspective correction for photographs
    #[arg(long, default_value_t = false)]
    no_dewarp: bool,

    /// Disable the dual-path preprocessing comparator
    #[arg(long, default_value_t = false)]
    no_dual_path: bool,

    /// Process independent pages in parallel
    #[arg(long, default_value_t = false)]
    parallel_pages: bool,

    /// Enable or disable the use of TensorRT for layout inference
    #[arg(long, default_value_t = false)]
    trt: bool,

    /// Enable or disable the use of CUDA for layout inference
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use CoreML for layout inference
    #[arg(long, default_value_t = cfg!(target_os = "macos"))]
    coreml: bool,

    /// CUDA device ID to use (0 for first GPU)
    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// Number of threads to use within individual operations
    #[arg(long, default_value = "16")]
    intra_threads: usize,

    /// Number of threads to use for parallel operation execution
    #[arg(long, default_value = "4")]
    inter_threads: usize,

    /// Check component readiness and exit
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Save layout overlays next to the artifacts
    #[arg(long, env = "LEDGERLENS_DEBUG", default_value_t = false)]
    debug: bool,
}

fn parse_ep_args(args: &Args) -> Vec<OrtExecutionProvider> {
    let mut providers = Vec::new();
    if args.trt {
        providers.push(OrtExecutionProvider::Trt(args.device_id));
    }
    if args.cuda {
        providers.push(OrtExecutionProvider::Cuda(args.device_id));
    }
    if args.coreml {
        providers.push(OrtExecutionProvider::CoreMl { ane_only: false });
    }
    providers.push(OrtExecutionProvider::Cpu);
    providers
}

fn build_engines(args: &Args) -> anyhow::Result<EngineBundle> {
    let mut engines = EngineBundle::default();

    if let Some(model_path) = &args.layout_model {
        let ort_config = OrtConfig {
            execution_providers: parse_ep_args(args),
            intra_threads: args.intra_threads,
            inter_threads: args.inter_threads,
        };
        let model = OrtLayoutModel::from_file(model_path, ort_config)?;
        engines = engines.with_layout(Arc::new(model));
    }

    if let Some(command) = &args.ocr_command {
        engines = engines.with_primary_ocr(Arc::new(CommandOcr::new(command, Vec::new())));
    }
    if let Some(tesseract) = TesseractOcr::discover() {
        engines = engines.with_secondary_ocr(Arc::new(tesseract));
    }
    if let Some(command) = &args.donut_command {
        engines = engines.with_donut(Arc::new(CommandDonut::new(command, Vec::new())));
    }
    if let Some(command) = &args.htr_command {
        engines = engines.with_htr(Arc::new(CommandHtr::new(command, Vec::new())));
    }
    if let Some(url) = &args.llm_url {
        engines = engines.with_llm(Arc::new(OllamaClient::new(
            url.clone(),
            args.llm_model.clone(),
        )?));
    }

    Ok(engines)
}

fn print_readiness(engines: &EngineBundle) {
    let report = readiness::probe(engines);
    for component in &report.components {
        let mark = if component.available {
            "✓".green().bold()
        } else if component.required {
            "✗".red().bold()
        } else {
            "-".yellow()
        };
        let requirement = if component.required {
            "required"
        } else {
            "optional"
        };
        println!("{} {} ({})", mark, component.name, requirement);
        if let Some(detail) = &component.detail {
            println!("    {}", detail.dimmed());
        }
    }
    if report.ready {
        println!("{} ready to process documents", "✓".green().bold());
    } else {
        println!(
            "{} missing required components: {}",
            "✗".red().bold(),
            report.missing_required.join(", ")
        );
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let engines = match build_engines(&args) {
        Ok(engines) => engines,
        Err(e) => {
            eprintln!("{} {e:#}", "✗".red().bold());
            std::process::exit(1);
        }
    };

    if args.check {
        print_readiness(&engines);
        return;
    }

    let mut config = PipelineConfig {
        raster_dpi: args.dpi,
        feature_dewarp: !args.no_dewarp,
        feature_dual_path_preproc: !args.no_dual_path,
        feature_donut_fallback: args.donut_command.is_some(),
        feature_llm_extraction: args.llm_url.is_some(),
        feature_htr: args.htr_command.is_some(),
        feature_templates: args.templates.is_some(),
        template_path: args.templates.clone(),
        parallel_pages: args.parallel_pages,
        date_order: match args.date_order {
            DateOrderArg::DayFirst => DateOrder::DayFirst,
            DateOrderArg::MonthFirst => DateOrder::MonthFirst,
        },
        ..Default::default()
    };
    if let Some(data_dir) = &args.data_dir {
        config.artifact_root = data_dir.clone();
    }

    let sink = Arc::new(FsArtifactSink::new(config.artifact_root.clone()));
    let pipeline = ScanPipeline::new(config, engines, sink).with_debug(args.debug);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}").unwrap(),
    );
    pb.set_message(format!("Processing {}", args.file_path.display()));
    pb.enable_steady_tick(std::time::Duration::from_millis(120));

    let report = pipeline.process(&args.file_path);
    pb.finish_and_clear();

    match report.status {
        Status::Error => {
            eprintln!(
                "{} {}",
                "✗".red().bold(),
                report.error.unwrap_or_else(|| "processing failed".into())
            );
            std::process::exit(1);
        }
        status => {
            let status_str = match status {
                Status::Ok => "ok".green().bold(),
                Status::Partial => "partial".yellow().bold(),
                Status::NeedsReview => "needs_review".red().bold(),
                Status::Error => unreachable!(),
            };
            let items = report
                .invoice
                .as_ref()
                .map(|i| i.line_items.len())
                .unwrap_or(0);
            println!(
                "{} {} | pages: {} | line items: {} | confidence: {:.2}",
                "✓".green().bold(),
                status_str,
                report.pages.len(),
                items,
                report.overall_confidence,
            );
            if let Some(invoice) = &report.invoice {
                if let Some(supplier) = &invoice.supplier_name {
                    println!("  supplier: {supplier}");
                }
                if let (Some(total), Some(currency)) = (&invoice.total_amount, invoice.currency) {
                    println!("  total: {total} {currency}");
                }
                for error in &invoice.validation_errors {
                    println!("  {} {}", "!".yellow().bold(), error);
                }
            }
            println!(
                "{} Results saved in: {}",
                "✓".green().bold(),
                report.artifact_dir.cyan().underline()
            );
        }
    }
}
