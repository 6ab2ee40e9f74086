//! Unit tests for the supervisor

#[cfg(test)]
mod tests {
    use crate::{Supervisor, SupervisorError, Worker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    #[tokio::test]
    async fn test_requires_waits_for_ready() {
        let supervisor = Supervisor::new("test");
        let events = log();

        let producer_events = Arc::clone(&events);
        supervisor.supervise(Worker::new("producer", move |p| {
            let events = Arc::clone(&producer_events);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                push(&events, "producer ready");
                p.ready();
                Ok(())
            }
        }));
        let consumer_events = Arc::clone(&events);
        supervisor.supervise(
            Worker::new("consumer", move |_p| {
                let events = Arc::clone(&consumer_events);
                async move {
                    push(&events, "consumer started");
                    Ok(())
                }
            })
            .requires(["producer"]),
        );

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["producer ready".to_string(), "consumer started".to_string()]
        );
        assert_eq!(supervisor.ready_workers(), vec!["producer".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_restarts_failed_worker() {
        let supervisor = Supervisor::new("test");
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        supervisor.supervise(
            Worker::new("flaky", move |_p| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(())
                }
            })
            .retry(true),
        );

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_is_recorded_and_shuts_down() {
        let supervisor = Supervisor::new("test");
        supervisor.supervise(Worker::new("failing", |_p| async {
            anyhow::bail!("boom")
        }));
        supervisor.supervise(Worker::new("idle", |p| async move {
            p.shutdown().await;
            Ok(())
        }));

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], SupervisorError::Worker { name, .. } if name == "failing"));
        assert!(errors[0].to_string().contains("boom"));
        assert!(supervisor.is_shutting_down());
    }

    #[tokio::test]
    async fn test_panic_becomes_error_with_backtrace() {
        let supervisor = Supervisor::new("test");
        supervisor.supervise(Worker::new("panicky", |_p| async {
            let values: Vec<u32> = Vec::new();
            if values.is_empty() {
                panic!("worker exploded");
            }
            Ok(())
        }));

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            SupervisorError::Panic {
                name,
                message,
                backtrace,
            } => {
                assert_eq!(name, "panicky");
                assert_eq!(message, "worker exploded");
                assert!(!backtrace.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(errors[0].worker(), "panicky");
    }

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_dependency_order() {
        let supervisor = Supervisor::new("test");
        let events = log();

        for (name, requires) in [("base", None), ("middle", Some("base")), ("top", Some("middle"))] {
            let events = Arc::clone(&events);
            let mut worker = Worker::new(name, move |p| {
                let events = Arc::clone(&events);
                async move {
                    p.ready();
                    p.shutdown().await;
                    push(&events, p.name());
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                }
            });
            if let Some(dependency) = requires {
                worker = worker.requires([dependency]);
            }
            supervisor.supervise(worker);
        }

        let running = supervisor.clone();
        let run = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown();
        supervisor.shutdown();

        let errors = timeout(LIMIT, run).await.unwrap().unwrap();
        assert!(errors.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["top".to_string(), "middle".to_string(), "base".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_abandoned() {
        let supervisor = Supervisor::with_grace("test", Duration::from_millis(50));
        supervisor.supervise(Worker::new("stubborn", |_p| async {
            std::future::pending::<()>().await;
            Ok(())
        }));

        let running = supervisor.clone();
        let run = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.shutdown();

        let errors = timeout(LIMIT, run).await.unwrap().unwrap();
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_do_clean_runs_cleanup_on_shutdown() {
        let supervisor = Supervisor::with_grace("test", Duration::from_millis(200));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let outcome = Arc::new(Mutex::new(None));

        let cleaned_flag = Arc::clone(&cleaned);
        let outcome_slot = Arc::clone(&outcome);
        supervisor.supervise(Worker::new("blocked", move |p| {
            let cleaned = Arc::clone(&cleaned_flag);
            let outcome = Arc::clone(&outcome_slot);
            async move {
                let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
                let result = p
                    .do_clean(
                        async move {
                            let _ = release_rx.await;
                            Ok("released")
                        },
                        async move {
                            cleaned.fetch_add(1, Ordering::SeqCst);
                            let _ = release_tx.send(());
                            Ok(())
                        },
                    )
                    .await;
                *outcome.lock().unwrap() = Some(result.map_err(|e| e.to_string()));
                Ok(())
            }
        }));

        let running = supervisor.clone();
        let run = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.shutdown();

        let errors = timeout(LIMIT, run).await.unwrap().unwrap();
        assert!(errors.is_empty());
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(*outcome.lock().unwrap(), Some(Ok("released")));
    }

    #[tokio::test]
    async fn test_do_clean_without_shutdown_skips_cleanup() {
        let supervisor = Supervisor::new("test");
        let cleaned = Arc::new(AtomicUsize::new(0));

        let cleaned_flag = Arc::clone(&cleaned);
        supervisor.supervise(Worker::new("quick", move |p| {
            let cleaned = Arc::clone(&cleaned_flag);
            async move {
                let value = p
                    .do_clean(async { Ok(7) }, async move {
                        cleaned.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                anyhow::ensure!(value == 7, "unexpected value {value}");
                Ok(())
            }
        }));

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_child_stops_with_handle_and_parent() {
        let supervisor = Supervisor::new("test");
        let events = log();

        let parent_events = Arc::clone(&events);
        supervisor.supervise(Worker::new("parent", move |p| {
            let events = Arc::clone(&parent_events);
            async move {
                let child_events = Arc::clone(&events);
                let child = p.go(Worker::new("child", move |c| {
                    let events = Arc::clone(&child_events);
                    async move {
                        c.shutdown().await;
                        push(&events, "child stopped");
                        Ok(())
                    }
                }));
                assert!(!child.is_finished());
                assert!(child.stop().await);
                push(&events, "parent saw child stop");

                let orphan_events = Arc::clone(&events);
                p.go(Worker::new("second-child", move |c| {
                    let events = Arc::clone(&orphan_events);
                    async move {
                        c.shutdown().await;
                        push(&events, "second child stopped");
                        Ok(())
                    }
                }));
                Ok(())
            }
        }));
        supervisor.supervise(Worker::new("trigger", |p| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.supervisor().shutdown();
            Ok(())
        }));

        let errors = timeout(LIMIT, supervisor.run()).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "child stopped".to_string(),
                "parent saw child stop".to_string(),
                "second child stopped".to_string(),
            ]
        );
    }
}
