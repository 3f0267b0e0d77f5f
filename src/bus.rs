//! Plan publication.

use crate::error::{PlannerError, PlannerResult};
use crate::types::PathPlan;
use crossbeam::channel::{Receiver, Sender};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

pub trait PlanSink {
    fn publish(&mut self, plan: &PathPlan) -> PlannerResult<()>;
}

/// Collects plans in memory.
impl PlanSink for Vec<PathPlan> {
    fn publish(&mut self, plan: &PathPlan) -> PlannerResult<()> {
        self.push(plan.clone());
        Ok(())
    }
}

/// Hands plans to another thread.
impl PlanSink for Sender<PathPlan> {
    fn publish(&mut self, plan: &PathPlan) -> PlannerResult<()> {
        self.send(plan.clone())
            .map_err(|_| PlannerError::Store("plan receiver dropped".into()))
    }
}

/// Readiness signal sent once before the first real plan.
pub fn publish_bootstrap(sink: &mut dyn PlanSink) -> PlannerResult<()> {
    sink.publish(&PathPlan::bootstrap())
}

/// Write every received plan as one JSON line until the channel closes.
///
/// Returns the number of plans written.
pub fn spawn_plan_writer(
    rx: Receiver<PathPlan>,
    path: PathBuf,
) -> std::io::Result<JoinHandle<std::io::Result<u64>>> {
    let file = File::create(&path)?;
    thread::Builder::new()
        .name("plan-writer".into())
        .spawn(move || {
            let mut out = BufWriter::new(file);
            let mut written = 0u64;
            for plan in rx {
                serde_json::to_writer(&mut out, &plan)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
            log::info!("Wrote {} plans to {}", written, path.display());
            Ok(written)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_bootstrap_is_first() {
        let mut plans: Vec<PathPlan> = Vec::new();
        publish_bootstrap(&mut plans).unwrap();
        assert_eq!(plans.len(), 1);
        assert!(plans[0].is_bootstrap());
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (mut tx, rx) = unbounded::<PathPlan>();
        tx.publish(&PathPlan::default()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PathPlan::default());
        drop(rx);
        assert!(tx.publish(&PathPlan::default()).is_err());
    }

    #[test]
    fn test_writer_emits_json_lines() {
        let path = std::env::temp_dir().join(format!("plans_{}.jsonl", std::process::id()));
        let (mut tx, rx) = unbounded();
        let handle = spawn_plan_writer(rx, path.clone()).unwrap();

        publish_bootstrap(&mut tx).unwrap();
        let plan = PathPlan {
            angle_steers: 1.5,
            ..Default::default()
        };
        tx.publish(&plan).unwrap();
        drop(tx);

        assert_eq!(handle.join().unwrap().unwrap(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: PathPlan = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(decoded.angle_steers, 1.5);
        std::fs::remove_file(&path).unwrap();
    }
}
