use anyhow::{bail, Result};
use log::{info, warn};
use novelforge::core::config::Config;
use novelforge::core::io::{NativeStorage, Storage};
use novelforge::services::llm::create_llm;
use novelforge::services::setup;
use novelforge::services::store::{ChapterStore, StorageChapterStore};
use novelforge::services::workflow::{AlwaysContinue, ChapterGate, Novelist, RunReport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let llm = create_llm(&config.llm)?;
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let store = StorageChapterStore::new(storage, config.output_folder.clone());

    let existing = match store.load_bible().await {
        Ok(bible) => bible,
        Err(e) => {
            warn!("Ignoring unreadable story bible: {:#}", e);
            None
        }
    };
    let generated = store.list_generated_chapters().await?;
    let progress = store.load_progress().await?;

    let gate: Box<dyn ChapterGate> = if config.unattended {
        Box::new(AlwaysContinue)
    } else {
        Box::new(setup::ConfirmGate)
    };
    let novelist = Novelist::new(llm, Box::new(store), gate, config.max_steps);

    let resumable = match existing {
        Some(bible) => {
            let next_chapter = progress.first_pending(bible.plot_outline.len()) + 1;
            if setup::confirm_resume(&config, &bible, next_chapter)? {
                Some((bible, next_chapter))
            } else {
                None
            }
        }
        None => None,
    };

    let report = match resumable {
        Some((bible, next_chapter)) => {
            info!("Resuming story from {}", config.output_folder);
            let states = bible.initial_states.clone();
            novelist.resume(&bible, next_chapter - 1, states).await?
        }
        None => {
            let inputs = setup::collect_concepts(&mut config)?;
            if !generated.is_empty() {
                warn!(
                    "Starting a new story; existing chapters in {} will be overwritten",
                    config.output_folder
                );
            }
            novelist.run(inputs).await?
        }
    };

    print_report(&report);
    if let Some(failure) = report.failure {
        bail!("Generation stopped: {}", failure);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "Chapters completed: {} ({} scenes written)",
        report.chapters_completed.len(),
        report.scenes_written
    );
    if let Some(debug) = &report.debug_output {
        println!("Last model output:\n{}", debug);
    }
}
