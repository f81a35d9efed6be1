use super::*;
use std::thread;

#[test]
fn test_ready_completion_is_done() {
    let completion = Completion::ready(Ok(5));
    assert!(completion.is_done());
    assert_eq!(completion.wait(), Ok(5));
}

#[test]
fn test_completion_resolved_from_other_thread() {
    let (completer, completion) = Completion::<u32>::pending();
    assert!(!completion.is_done());
    let handle = thread::spawn(move || completer.succeed(3));
    assert_eq!(completion.wait_timeout(Duration::from_secs(5)), Some(Ok(3)));
    handle.join().unwrap();
}

#[test]
fn test_wait_timeout_returns_none_while_pending() {
    let (_completer, completion) = Completion::<()>::pending();
    assert_eq!(completion.wait_timeout(Duration::from_millis(10)), None);
    assert_eq!(completion.try_result(), None);
}

#[test]
fn test_dropped_completer_fails_completion() {
    let (completer, completion) = Completion::<()>::pending();
    drop(completer);
    assert!(matches!(completion.wait(), Err(EngineError::IllegalState(_))));
}
