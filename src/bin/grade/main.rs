use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::Path;

use sandbox_grader::{
    error::Error,
    runner::{self, ExecuteOptions, Language, Submission},
    settings::Settings,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML file containing the program settings
    #[arg(short, long)]
    settings: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Grades one submission and prints the result as JSON
    Run {
        /// c, python or javascript
        #[arg(short, long)]
        language: Language,

        /// File with the submitted source
        #[arg(long)]
        submission: String,

        /// File with the test harness
        #[arg(long)]
        harness: String,

        /// Wall-clock limit, e.g. 5s
        #[arg(short, long, default_value = "5s")]
        timeout: String,

        /// Re-run compiled submissions under the memory checker
        #[arg(long, default_value_t = false)]
        memcheck: bool,
    },
    ValidateSettings {
        /// Also check that every support file is present
        #[arg(short = 'S', long, default_value_t = false)]
        check_support_files: bool,
    },
}

fn main() -> Result<(), Error> {
    let args: Args = Args::parse();
    let s = Settings::load(&args.settings)?;
    s.setup_logging("grade")?;
    match args.command {
        Commands::Run {
            language,
            submission,
            harness,
            timeout,
            memcheck,
        } => run(
            &s,
            language,
            &submission,
            &harness,
            ExecuteOptions {
                timeout: timeout,
                use_memcheck: memcheck,
            },
        ),
        Commands::ValidateSettings {
            check_support_files,
        } => validate_settings(s, check_support_files),
    }
}

fn run(
    s: &Settings,
    language: Language,
    submission_path: &str,
    harness_path: &str,
    options: ExecuteOptions,
) -> Result<(), Error> {
    let submission = Submission {
        source: std::fs::read_to_string(submission_path)
            .inspect_err(|e| log::error!("Could not read {submission_path}: {e}"))?,
        harness: std::fs::read_to_string(harness_path)
            .inspect_err(|e| log::error!("Could not read {harness_path}: {e}"))?,
        language: language,
        options: options,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(runner::execute(s, &submission))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn validate_settings(s: Settings, check_support_files: bool) -> Result<(), Error> {
    log::info!("VALIDATING SETTINGS");
    dbg!(&s);

    for (name, profile) in s.interpreted.iter() {
        if let Err(e) = name.parse::<Language>() {
            log::warn!("Profile [interpreted.{name}] is not used: {e}");
        } else if profile.command.is_empty() {
            return Err(Error::from(format!(
                "Profile [interpreted.{name}] has an empty command"
            )));
        }
    }

    if check_support_files {
        log::debug!("Checking support files in {}", &s.compiled.support_dir);
        let missing = s
            .compiled
            .support_files
            .iter()
            .filter(|f| !Path::new(&s.compiled.support_dir).join(f).is_file())
            .map(|f| format!("\"{f}\""))
            .join(", ");
        if !missing.is_empty() {
            return Err(Error::from(format!(
                "Missing support files in {}: {missing}",
                &s.compiled.support_dir
            )));
        }
    }
    Ok(())
}
