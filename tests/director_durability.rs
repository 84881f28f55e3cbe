//! Director durability, end-to-end (spec.md §8 scenario 6): a work file
//! with two tasks for one node, killed after the first task succeeds,
//! resumes on restart attempting only the second, with the first task's
//! `actual`/`info` preserved.

use devparam::director::FleetDirector;
use devparam::mock_transport::MockTransport;
use devparam::packet::Frame;
use devparam::taskfile::{self, DirectorTask};
use devparam::transport::{Packet, Transport, TransportMode};
use devparam::types::ParameterType;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn write_two_task_file(path: &std::path::Path) {
    let tasks = vec![
        DirectorTask::new(0x1234, "chan".into(), ParameterType::Uint8, Some(vec![5])),
        DirectorTask::new(0x1234, "power".into(), ParameterType::Uint8, Some(vec![9])),
    ];
    taskfile::write_tasks(&tasks, path).unwrap();
}

/// Answers every `SetById` it sees on `mock` by echoing the requested
/// value back as a `Parameter` reply, until `stop` is set.
fn spawn_autoresponder(mock: Arc<MockTransport>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut answered = 0;
        while !stop.load(Ordering::SeqCst) {
            let sent = mock.sent();
            if sent.len() > answered {
                let request = &sent[answered];
                if let Ok(Frame::SetById { id, value }) = Frame::decode(request.get_payload()) {
                    let mut reply = Packet::default();
                    reply.set_payload(
                        Frame::Parameter {
                            ty: ParameterType::Uint8.code(),
                            seqnum: answered as u8,
                            id,
                            value,
                        }
                        .encode()
                        .unwrap(),
                    );
                    reply.set_source(request.destination().unwrap());
                    mock.inject(reply);
                }
                answered += 1;
            } else {
                std::thread::yield_now();
            }
        }
    })
}

#[test]
fn interrupted_run_resumes_only_the_remaining_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.csv");
    write_two_task_file(&path);

    // First run: interrupt as soon as the first task's result is
    // persisted to disk, simulating a kill right after it completes.
    {
        let mock = Arc::new(MockTransport::new(TransportMode::ActiveMessage {
            group: 0x22,
            local: 1,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let responder = spawn_autoresponder(mock.clone(), stop.clone());

        let mut director = FleetDirector::start(mock, &path).unwrap();
        director.set_timeout(Duration::from_millis(500));

        let interrupted = Arc::new(AtomicBool::new(false));
        let watch_path = path.clone();
        let watch_interrupted = interrupted.clone();
        let watcher = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                if let Ok(tasks) = taskfile::read_tasks(&watch_path) {
                    if tasks[0].actual.is_some() {
                        watch_interrupted.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                if Instant::now() > deadline {
                    return;
                }
                std::thread::yield_now();
            }
        });

        let finished = director.run(&interrupted);
        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
        watcher.join().unwrap();
        assert!(!finished, "run should have been interrupted");
    }

    let after_kill = taskfile::read_tasks(&path).unwrap();
    assert_eq!(after_kill[0].actual, Some(vec![5]));
    assert!(after_kill[1].actual.is_none());
    let preserved_info = after_kill[0].info.clone();
    assert!(!preserved_info.is_empty());

    // Restart: only the second task should be attempted; the first's
    // actual/info must come back untouched.
    {
        let mock = Arc::new(MockTransport::new(TransportMode::ActiveMessage {
            group: 0x22,
            local: 1,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let responder = spawn_autoresponder(mock.clone(), stop.clone());

        let mut director = FleetDirector::start(mock, &path).unwrap();
        director.set_timeout(Duration::from_millis(500));
        let interrupted = AtomicBool::new(false);
        let finished = director.run(&interrupted);
        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
        assert!(finished);
    }

    let final_tasks = taskfile::read_tasks(&path).unwrap();
    assert_eq!(final_tasks[0].actual, Some(vec![5]));
    assert_eq!(final_tasks[0].info, preserved_info);
    assert_eq!(final_tasks[1].actual, Some(vec![9]));
}
