mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, Offline, Sent, StaticSource};
use meshrelay::format::BROADCAST_ADDR;
use meshrelay::meshtastic::queue::{SendAction, TransportSource, MAX_QUEUE_SIZE, MINIMUM_MESSAGE_DELAY};
use meshrelay::meshtastic::{MappingHint, OutboundQueue, RadioTransport, TransportError};
use meshrelay::storage::MessageStore;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn noop() -> SendAction {
    Box::new(|_t: &dyn RadioTransport| -> Result<Option<u32>, TransportError> { Ok(None) })
}

#[tokio::test]
async fn queue_refuses_the_501st_job() {
    let queue = OutboundQueue::new(Arc::new(Offline));
    queue.start(2.0);
    for i in 0..MAX_QUEUE_SIZE {
        assert!(queue.enqueue(noop(), format!("job {i}"), None), "job {i} refused");
    }
    assert!(!queue.enqueue(noop(), "one too many", None));
    assert_eq!(queue.size(), MAX_QUEUE_SIZE);
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn sends_are_spaced_by_the_radio_minimum() {
    let transport = MockTransport::new();
    let queue = OutboundQueue::new(Arc::new(StaticSource(transport)));
    // below the floor on purpose
    queue.start(0.5);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..4u32 {
        let tx = tx.clone();
        let action: SendAction = Box::new(move |_t: &dyn RadioTransport| -> Result<Option<u32>, TransportError> {
            let _ = tx.send(i);
            Ok(Some(i))
        });
        assert!(queue.enqueue(action, format!("paced {i}"), None));
    }

    let mut arrivals = Vec::new();
    while arrivals.len() < 4 {
        let job = rx.recv().await.unwrap();
        arrivals.push((job, Instant::now()));
    }
    let order: Vec<u32> = arrivals.iter().map(|(j, _)| *j).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    for pair in arrivals.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= MINIMUM_MESSAGE_DELAY, "gap {:?} under minimum", gap);
    }
    queue.stop();
}

#[tokio::test]
async fn successful_send_records_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::open(dir.path().join("db")).unwrap();
    let transport = MockTransport::new();
    let queue = OutboundQueue::with_store(Arc::new(StaticSource(transport.clone())), store.clone(), 10);
    queue.start(2.0);

    let hint = MappingHint {
        event_id: "$m1".into(),
        room_id: common::GENERAL.into(),
        text: "hello radio".into(),
        meshnet: common::LOCAL_MESHNET.into(),
    };
    assert!(queue.enqueue_text("Bob[M]: hello radio".into(), 0, BROADCAST_ADDR, "test", Some(hint)));

    assert!(common::eventually(|| store.get_message_map_by_event_id("$m1").unwrap().is_some()).await);
    let row = store.get_message_map_by_event_id("$m1").unwrap().unwrap();
    assert_eq!(row.mesh_id, Some(1000));
    assert_eq!(row.text, "hello radio");
    assert_eq!(
        transport.sent(),
        vec![Sent::Text {
            text: "Bob[M]: hello radio".into(),
            channel: 0,
            destination: BROADCAST_ADDR
        }]
    );
    queue.stop();
}

struct Switch {
    transport: Arc<MockTransport>,
    online: AtomicBool,
}

impl TransportSource for Switch {
    fn ready_transport(&self) -> Option<Arc<dyn RadioTransport>> {
        if self.online.load(Ordering::SeqCst) {
            Some(self.transport.clone())
        } else {
            None
        }
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_wait_for_the_radio() {
    let transport = MockTransport::new();
    let source = Arc::new(Switch {
        transport: transport.clone(),
        online: AtomicBool::new(false),
    });
    let queue = OutboundQueue::new(source.clone());
    queue.start(2.0);
    assert!(queue.enqueue_text("held".into(), 0, BROADCAST_ADDR, "held", None));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(transport.sent().is_empty());
    assert_eq!(queue.size(), 1);

    source.online.store(true, Ordering::SeqCst);
    let mut delivered = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !transport.sent().is_empty() {
            delivered = true;
            break;
        }
    }
    assert!(delivered);
    assert_eq!(queue.size(), 0);
    assert!(queue.status().last_send_time.is_some());
    queue.stop();
}

#[tokio::test]
async fn failed_send_is_not_retried() {
    let transport = MockTransport::new();
    let queue = OutboundQueue::new(Arc::new(StaticSource(transport)));
    queue.start(2.0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let action: SendAction = Box::new(move |_t: &dyn RadioTransport| -> Result<Option<u32>, TransportError> {
        let _ = tx.send(());
        Err(TransportError::Send("radio busy".into()))
    });
    assert!(queue.enqueue(action, "doomed", None));
    rx.recv().await.unwrap();
    assert!(common::eventually(|| queue.size() == 0).await);
    assert!(queue.is_running());
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn concurrent_enqueue_from_plain_threads() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 150;

    let transport = MockTransport::new();
    let source = Arc::new(Switch {
        transport: transport.clone(),
        online: AtomicBool::new(false),
    });
    let queue = OutboundQueue::new(source.clone());
    queue.start(2.0);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let workers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let queue = queue.clone();
            let order = order.clone();
            std::thread::spawn(move || {
                let mut accepted = 0;
                for seq in 0..PER_THREAD {
                    let order = order.clone();
                    let action: SendAction =
                        Box::new(move |_t: &dyn RadioTransport| -> Result<Option<u32>, TransportError> {
                            order.lock().unwrap().push((thread, seq));
                            Ok(None)
                        });
                    if queue.enqueue(action, format!("thread {thread} job {seq}"), None) {
                        accepted += 1;
                    }
                }
                accepted
            })
        })
        .collect();
    let accepted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(accepted, MAX_QUEUE_SIZE.min(THREADS * PER_THREAD));
    assert_eq!(queue.size(), MAX_QUEUE_SIZE);

    source.online.store(true, Ordering::SeqCst);
    for _ in 0..MAX_QUEUE_SIZE * 2 {
        if order.lock().unwrap().len() == accepted {
            break;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), accepted);
    for thread in 0..THREADS {
        let seqs: Vec<usize> = order.iter().filter(|(t, _)| *t == thread).map(|(_, s)| *s).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "thread {thread} jobs out of order");
    }
    queue.stop();
}
