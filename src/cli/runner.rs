//! Dispatches parsed `Commands` into `Orchestrator`/`container::recovery` calls and prints a
//! line or two of human-readable output. No business logic lives here — every command is a
//! thin wrapper around a call already implemented elsewhere.

use std::time::Duration;

use crate::cli::command::Commands;
use crate::errors::WaxError;
use crate::orchestrator::Orchestrator;
use crate::search::SearchRequest;
use crate::session::SessionMode;

const WRITE_WAIT: Duration = Duration::from_secs(5);

pub fn run(command: Commands) -> Result<(), WaxError> {
    match command {
        Commands::Open { path } => {
            let session = crate::session::Session::open(&path, SessionMode::ReadWriteWait { timeout: WRITE_WAIT }, None)?;
            let frame_count = session.frame_metas().len();
            session.close()?;
            println!("opened {} frames={}", path.display(), frame_count);
            Ok(())
        }
        Commands::Remember { path, text, role, kind } => {
            let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteWait { timeout: WRITE_WAIT }, None)?;
            let ids = orchestrator.remember(text, role.into(), kind)?;
            orchestrator.flush()?;
            for id in ids {
                println!("remembered frame_id={id}");
            }
            Ok(())
        }
        Commands::Recall { path, query, top_k } => {
            let orchestrator = Orchestrator::open(&path, SessionMode::ReadOnly, None)?;
            let response = orchestrator.recall(SearchRequest::text_only(query, top_k));
            for scored in response.results {
                println!("frame_id={} rrf_score={:.6}", scored.frame_id, scored.rrf_score);
            }
            Ok(())
        }
        Commands::Flush { path } => {
            let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteWait { timeout: WRITE_WAIT }, None)?;
            orchestrator.flush()?;
            println!("flushed {}", path.display());
            Ok(())
        }
        Commands::Verify { path } => {
            let mut file = crate::fileio::open_rw(&path)?;
            let config = crate::config::WaxConfig::from_env_and_defaults(crate::config::WaxConfig::default());
            let state = crate::container::recovery::recover(&mut file, config.wal_capacity_bytes, config.fsync_policy.into())?;
            println!(
                "ok generation={} committed_frames={} wal_committed_seq={}",
                state.header.generation,
                state.frame_store.committed.len(),
                state.wal.last_sequence
            );
            Ok(())
        }
        Commands::Stats { path } => {
            let orchestrator = Orchestrator::open(&path, SessionMode::ReadOnly, None)?;
            let metas = orchestrator.frame_metas();
            let active = metas.iter().filter(|m| m.status == crate::frame::FrameStatus::Active).count();
            println!("frames={} active={}", metas.len(), active);
            println!(
                "compiled_features={}",
                if crate::buildinfo::COMPILED_FEATURES.is_empty() {
                    "none".to_string()
                } else {
                    crate::buildinfo::COMPILED_FEATURES.join(",")
                }
            );
            Ok(())
        }
    }
}
