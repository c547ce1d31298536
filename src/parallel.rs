//! Optional bounded worker pool for rendering (the `parallel` cargo
//! feature). Change detection and every catalog write stay on the
//! coordinating thread, so upserts remain serialized per graph_id; only the
//! I/O-bound artifact rendering fans out. Workers push results into an
//! unbounded channel and therefore never block, which keeps the bounded job
//! channel free of deadlocks.
use crossbeam_channel::{bounded, unbounded};
use eyre::Result;

use crate::catalog::Catalog;
use crate::detect::Decision;
use crate::pipeline::{self, ExportConfig, Failure, RunSummary, Stage};
use crate::record::Conversation;
use crate::render::{self, RenderOutput};

pub(crate) fn process_all(
    config: &ExportConfig,
    catalog: Option<&Catalog>,
    conversations: &[Conversation],
    summary: &mut RunSummary,
) {
    let pb = pipeline::progress_bar(config, conversations.len() as u64);

    // Decide on the coordinating thread; only conversations that need work
    // are fanned out.
    let mut jobs: Vec<(usize, String)> = Vec::new();
    for (idx, conv) in conversations.iter().enumerate() {
        match pipeline::decide(conv, config, catalog) {
            Ok(Decision::Skip(reason)) => {
                match pipeline::touch_skipped(conv, reason, catalog) {
                    Ok(()) => {
                        summary.skipped += 1;
                        if config.verbose {
                            pb.println(format!("Skipped:  {} ({})", conv.slug, reason));
                        }
                    }
                    Err(failure) => {
                        pb.println(format!(
                            "Error [{}] at {}: {}",
                            failure.graph_id, failure.stage, failure.reason
                        ));
                        summary.failures.push(failure);
                    }
                }
                pb.inc(1);
            }
            Ok(Decision::Export { content_hash }) => jobs.push((idx, content_hash)),
            Err(failure) => {
                pb.println(format!(
                    "Error [{}] at {}: {}",
                    failure.graph_id, failure.stage, failure.reason
                ));
                summary.failures.push(failure);
                pb.inc(1);
            }
        }
    }

    let n_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(jobs.len().max(1));

    let (job_tx, job_rx) = bounded::<(usize, String)>(32);
    let (res_tx, res_rx) = unbounded::<(usize, String, Result<RenderOutput>)>();

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let output_dir = &config.output_dir;
            s.spawn(move || {
                while let Ok((idx, hash)) = job_rx.recv() {
                    let rendered =
                        render::render_conversation(output_dir, &conversations[idx], &hash);
                    if res_tx.send((idx, hash, rendered)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(res_tx);

        for job in jobs {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        for (idx, hash, rendered) in res_rx.iter() {
            let conv = &conversations[idx];
            match rendered {
                Ok(out) => {
                    let catalogued = match catalog {
                        Some(cat) => {
                            pipeline::upsert_rendered(cat, conv, &hash, &out).map_err(|e| {
                                Failure {
                                    graph_id: conv.graph_id.clone(),
                                    stage: Stage::Catalog,
                                    reason: format!("{:#}", e),
                                }
                            })
                        }
                        None => Ok(()),
                    };
                    match catalogued {
                        Ok(()) => {
                            summary.exported += 1;
                            if config.verbose {
                                pb.println(format!("Exported: {}", conv.slug));
                            }
                        }
                        Err(failure) => {
                            pb.println(format!(
                                "Error [{}] at {}: {}",
                                failure.graph_id, failure.stage, failure.reason
                            ));
                            summary.failures.push(failure);
                        }
                    }
                }
                Err(e) => {
                    let failure = Failure {
                        graph_id: conv.graph_id.clone(),
                        stage: Stage::Render,
                        reason: format!("{:#}", e),
                    };
                    pb.println(format!(
                        "Error [{}] at {}: {}",
                        failure.graph_id, failure.stage, failure.reason
                    ));
                    summary.failures.push(failure);
                }
            }
            pb.inc(1);
        }
    });

    pb.finish_and_clear();
}
