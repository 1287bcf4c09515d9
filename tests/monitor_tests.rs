use std::time::{Duration, Instant};

use sysgpio::{
    Direction, EdgeDetect, EdgeSource, GpioError, GpioPin, MonitorConfig, SimPin, Wake, attach,
    attach_with,
};
use tokio::time::timeout;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);
const POLL: Option<Duration> = Some(Duration::from_millis(50));

fn wired_pair(edge: EdgeDetect) -> (SimPin, SimPin) {
    let drive = SimPin::named("drive", Direction::Out, None);
    let sense = SimPin::named("sense", Direction::In, None);
    sense.set_edge(edge).unwrap();
    drive.wire([&sense]).unwrap();
    (drive, sense)
}

#[tokio::test]
async fn delivers_two_transitions_in_order() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    let mut stream = attach(sense, POLL).unwrap();

    drive.set_state(true).unwrap();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(true));
    drive.set_state(false).unwrap();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(false));

    assert!(timeout(QUIET, stream.recv()).await.is_err());
    stream.close().unwrap();
}

#[tokio::test]
async fn stale_level_is_not_reported() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    drive.set_state(true).unwrap();

    let mut stream = attach(sense, POLL).unwrap();
    assert!(timeout(QUIET, stream.recv()).await.is_err());
    stream.close().unwrap();
}

#[tokio::test]
async fn edge_raised_between_monitors_is_discarded_on_reattach() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    attach(sense.clone(), POLL).unwrap().close().unwrap();

    // nobody is watching, the readiness flag stays raised
    drive.set_state(true).unwrap();

    let mut stream = attach(sense, POLL).unwrap();
    assert!(timeout(QUIET, stream.recv()).await.is_err());

    drive.set_state(false).unwrap();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(false));
    stream.close().unwrap();
}

#[tokio::test]
async fn rising_mode_ignores_falling_edges() {
    let (drive, sense) = wired_pair(EdgeDetect::Rising);
    let mut stream = attach(sense, POLL).unwrap();

    drive.set_state(true).unwrap();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(true));

    drive.set_state(false).unwrap();
    assert!(timeout(QUIET, stream.recv()).await.is_err());

    drive.set_state(true).unwrap();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(true));
    stream.close().unwrap();
}

#[tokio::test]
async fn works_as_a_stream_with_indefinite_wait() {
    let (drive, sense) = wired_pair(EdgeDetect::Falling);
    drive.set_state(true).unwrap();
    let mut stream = attach(sense, None).unwrap();

    drive.set_state(false).unwrap();
    assert_eq!(timeout(WAIT, stream.next()).await.unwrap(), Some(false));
    stream.close().unwrap();
}

#[test]
fn edge_none_is_rejected_before_monitoring() {
    let (_drive, sense) = wired_pair(EdgeDetect::None);

    let err = attach(sense.clone(), POLL).err().unwrap();
    assert!(matches!(err, GpioError::Config(_)));

    // nothing was left claimed
    sense.set_edge(EdgeDetect::Both).unwrap();
    let stream = attach(sense, POLL).unwrap();
    stream.close().unwrap();
}

#[test]
fn output_pins_cannot_be_monitored() {
    let (drive, _sense) = wired_pair(EdgeDetect::Both);
    drive.set_edge(EdgeDetect::Both).unwrap();

    let err = attach(drive, POLL).err().unwrap();
    assert!(matches!(err, GpioError::Config(_)));
}

#[test]
fn second_monitor_on_same_pin_conflicts() {
    let (_drive, sense) = wired_pair(EdgeDetect::Both);

    let first = attach(sense.clone(), POLL).unwrap();
    let err = attach(sense.clone(), POLL).err().unwrap();
    assert!(matches!(err, GpioError::Conflict(_)));

    first.close().unwrap();
    let second = attach(sense, POLL).unwrap();
    second.close().unwrap();
}

#[tokio::test]
async fn closing_the_pin_ends_the_stream_with_an_error() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    let mut stream = attach(sense.clone(), None).unwrap();

    sense.close();
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), None);

    let err = stream.close().err().unwrap();
    assert!(matches!(err, GpioError::Closed(_)));
    assert!(matches!(drive.set_state(true), Ok(())));
}

#[tokio::test]
async fn canceller_interrupts_an_indefinite_wait() {
    let (_drive, sense) = wired_pair(EdgeDetect::Both);
    let mut stream = attach(sense, None).unwrap();

    let canceller = stream.canceller();
    canceller.cancel();
    assert!(canceller.is_cancelled());

    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), None);
    stream.close().unwrap();
}

#[tokio::test]
async fn canceller_interrupts_a_stalled_push() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    let mut stream = attach(sense, POLL).unwrap();

    // first value fills the buffer, the second blocks the monitor
    drive.set_state(true).unwrap();
    tokio::time::sleep(QUIET).await;
    drive.set_state(false).unwrap();
    tokio::time::sleep(QUIET).await;

    stream.canceller().cancel();
    tokio::time::sleep(QUIET).await;

    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), Some(true));
    assert_eq!(timeout(WAIT, stream.recv()).await.unwrap(), None);
    stream.close().unwrap();
}

#[tokio::test]
async fn configured_buffer_holds_several_values() {
    let (drive, sense) = wired_pair(EdgeDetect::Both);
    let config = MonitorConfig {
        timeout_ms: 50,
        buffer: 4,
    };
    let mut stream = attach_with(sense, &config).unwrap();

    for value in [true, false, true] {
        drive.set_state(value).unwrap();
        tokio::time::sleep(QUIET).await;
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(timeout(WAIT, stream.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, vec![true, false, true]);
    stream.close().unwrap();
}

#[test]
fn dropping_the_stream_releases_the_pin() {
    let (_drive, sense) = wired_pair(EdgeDetect::Both);

    let stream = attach(sense.clone(), None).unwrap();
    assert_eq!(stream.pin_name(), "sense");
    drop(stream);

    let stream = attach(sense, None).unwrap();
    stream.close().unwrap();
}

#[test]
fn sub_millisecond_timeout_still_blocks() {
    let (_drive, sense) = wired_pair(EdgeDetect::Both);
    let (_other_drive, other) = wired_pair(EdgeDetect::Both);
    let stream = attach(other, None).unwrap();
    let canceller = stream.canceller();

    let _claim = sense.claim().unwrap();
    let started = Instant::now();
    let wake = sense
        .wait_edge(&canceller, Some(Duration::from_micros(200)))
        .unwrap();
    assert_eq!(wake, Wake::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(1));

    stream.close().unwrap();
}
