use carrot_conveyor::pipeline::{
    Faultable, Faulted, Pipeline, PipelineOptions, Processed, StepOptions, WorkState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Outcomes = Arc<Mutex<Vec<Processed<String>>>>;

/// `parse → double → stringify`, with `double` taking longer on smaller numbers so that, run
/// concurrently, items finish out of order.
fn parse_double_stringify(
    options: PipelineOptions,
    fail_on: Option<u32>,
) -> (Pipeline<String, String>, Outcomes) {
    let outcomes = Outcomes::default();
    let mut pipeline = Pipeline::new(options);
    pipeline
        .add_sync_step("parse", StepOptions::default(), |raw: String| {
            raw.parse::<u32>()
        })
        .unwrap()
        .add_step("double", StepOptions::default(), move |n: u32| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(6 - n.min(5)) * 10)).await;
            if Some(n) == fail_on {
                anyhow::bail!("cannot double {n}");
            }
            Ok(n * 2)
        })
        .unwrap()
        .add_sync_step("stringify", StepOptions::default(), |n: u32| {
            Ok::<_, anyhow::Error>(n.to_string())
        })
        .unwrap();
    pipeline
        .finalize({
            let outcomes = Arc::clone(&outcomes);
            move |processed| outcomes.lock().unwrap().push(processed)
        })
        .unwrap();
    (pipeline, outcomes)
}

async fn run(pipeline: &Pipeline<String, String>) {
    for n in 1..=5 {
        pipeline.queue_for_execution(n.to_string()).await.unwrap();
    }
    pipeline.await_completion().await.unwrap();
}

#[tokio::test]
async fn ordered_stages_preserve_submission_order() {
    // Arrange
    let options = PipelineOptions::new("ordered").parallelism(4);
    let (pipeline, outcomes) = parse_double_stringify(options, None);

    // Act
    run(&pipeline).await;

    // Assert
    let outputs: Vec<String> = outcomes
        .lock()
        .unwrap()
        .drain(..)
        .map(|processed| processed.into_result().unwrap())
        .collect();
    assert_eq!(vec!["2", "4", "6", "8", "10"], outputs);
}

#[tokio::test]
async fn unordered_stages_produce_the_same_outputs() {
    // Arrange
    let options = PipelineOptions::new("unordered")
        .parallelism(4)
        .ensure_ordered(false);
    let (pipeline, outcomes) = parse_double_stringify(options, None);

    // Act
    run(&pipeline).await;

    // Assert
    let mut outputs: Vec<u32> = outcomes
        .lock()
        .unwrap()
        .drain(..)
        .map(|processed| processed.into_result().unwrap().parse().unwrap())
        .collect();
    outputs.sort_unstable();
    assert_eq!(vec![2, 4, 6, 8, 10], outputs);
}

#[tokio::test]
async fn a_failing_item_reaches_the_finalizer_with_its_fault() {
    // Arrange
    let options = PipelineOptions::new("faulty").parallelism(4);
    let (pipeline, outcomes) = parse_double_stringify(options, Some(3));

    // Act
    run(&pipeline).await;

    // Assert
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(5, outcomes.len());
    let faulted: Vec<_> = outcomes.iter().filter(|p| p.is_faulted()).collect();
    assert_eq!(1, faulted.len());
    assert_eq!(2, faulted[0].sequence());
    let fault = faulted[0].fault().unwrap();
    assert_eq!(1, fault.step_index());
    assert_eq!("double", fault.step_name());
    assert!(!fault.panicked());
    assert_eq!("cannot double 3", fault.error().to_string());

    let healthy: Vec<_> = outcomes
        .iter()
        .filter_map(|p| p.value().cloned())
        .collect();
    assert_eq!(vec!["2", "4", "8", "10"], healthy);

    let health = pipeline.health();
    assert!(!health.is_healthy());
    assert_eq!(5, health.processed);
    assert_eq!(1, health.faulted);
    assert_eq!(1, health.faulted_steps.len());
    assert_eq!("double", health.faulted_steps[0].name);
    assert!(pipeline.steps()[1].fault().is_some());
    assert!(pipeline.steps()[2].fault().is_none());
}

#[tokio::test]
async fn a_panicking_step_only_takes_down_its_item() {
    // Arrange
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline =
        Pipeline::<u32, u32>::new(PipelineOptions::new("panicky").parallelism(2));
    pipeline
        .add_sync_step("check", StepOptions::default(), |n: u32| {
            if n == 2 {
                panic!("two is not allowed");
            }
            Ok::<_, anyhow::Error>(n)
        })
        .unwrap();
    pipeline
        .finalize({
            let outcomes = Arc::clone(&outcomes);
            move |processed: Processed<u32>| {
                let outcome = processed.into_result().map_err(|fault| fault.panicked());
                outcomes.lock().unwrap().push(outcome);
            }
        })
        .unwrap();

    // Act
    for n in 1..=3 {
        pipeline.queue_for_execution(n).await.unwrap();
    }
    pipeline.await_completion().await.unwrap();

    // Assert
    assert_eq!(vec![Ok(1), Err(true), Ok(3)], *outcomes.lock().unwrap());
}

#[tokio::test]
async fn a_stage_runs_at_most_its_parallelism() {
    // Arrange
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::<u32, u32>::new(PipelineOptions::new("bounded"));
    pipeline
        .add_step("slow", StepOptions::default().parallelism(3), {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |n: u32| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(n)
                }
            }
        })
        .unwrap();
    pipeline.finalize(|_| {}).unwrap();

    // Act
    for n in 0..12 {
        pipeline.queue_for_execution(n).await.unwrap();
    }
    pipeline.await_completion().await.unwrap();

    // Assert
    assert_eq!(3, peak.load(Ordering::SeqCst));
    assert_eq!(0, running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn submissions_wait_once_the_buffers_are_full() {
    // Arrange
    let (gate, opened) = tokio::sync::watch::channel(false);
    let mut pipeline =
        Pipeline::<u32, u32>::new(PipelineOptions::new("backpressure").buffer_size(1));
    pipeline
        .add_step("gated", StepOptions::default(), move |n: u32| {
            let mut opened = opened.clone();
            async move {
                let _ = opened.wait_for(|open| *open).await;
                Ok::<_, anyhow::Error>(n)
            }
        })
        .unwrap();
    pipeline.finalize(|_| {}).unwrap();
    let pipeline = Arc::new(pipeline);

    // Act
    // One item is held by the step, one waits in its buffer.
    pipeline.queue_for_execution(1).await.unwrap();
    pipeline.queue_for_execution(2).await.unwrap();
    let third = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.queue_for_execution(3).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert!(!third.is_finished());
    gate.send_replace(true);
    third.await.unwrap().unwrap();
    pipeline.await_completion().await.unwrap();
    assert_eq!(3, pipeline.health().processed);
}

#[tokio::test]
async fn the_async_finalizer_sees_every_item() {
    // Arrange
    let total = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::<u32, u32>::new(PipelineOptions::default());
    pipeline
        .add_step("identity", StepOptions::default(), |n: u32| async move {
            Ok::<_, anyhow::Error>(n)
        })
        .unwrap();
    pipeline
        .finalize_async({
            let total = Arc::clone(&total);
            move |processed| {
                let total = Arc::clone(&total);
                async move {
                    tokio::task::yield_now().await;
                    let n = processed.into_result().unwrap();
                    total.fetch_add(n as usize, Ordering::SeqCst);
                }
            }
        })
        .unwrap();

    // Act
    for n in 1..=10 {
        pipeline.queue_for_execution(n).await.unwrap();
    }
    pipeline.await_completion().await.unwrap();

    // Assert
    assert_eq!(55, total.load(Ordering::SeqCst));
    assert_eq!(10, pipeline.health().submitted);
}

#[derive(Debug, PartialEq)]
struct Note(&'static str);

#[tokio::test]
async fn a_faulted_work_state_keeps_what_earlier_steps_produced() {
    // Arrange
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline =
        Pipeline::<WorkState, WorkState>::new(PipelineOptions::new("tag-then-fail"));
    pipeline
        .add_sync_faultable_step("tag", StepOptions::default(), |state: &mut WorkState| {
            state.insert(Note("tagged"));
            state.mark_step("tag", true);
            Ok::<_, anyhow::Error>(())
        })
        .unwrap()
        .add_faultable_step("boom", StepOptions::default(), |mut state: WorkState| async move {
            state.mark_step("boom", false);
            Err::<WorkState, _>(Faulted::new(state, anyhow::anyhow!("boom")))
        })
        .unwrap()
        .add_sync_faultable_step("unreachable", StepOptions::default(), |state: &mut WorkState| {
            state.insert(Note("too far"));
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();
    pipeline
        .finalize({
            let outcomes = Arc::clone(&outcomes);
            move |processed: Processed<WorkState>| outcomes.lock().unwrap().push(processed)
        })
        .unwrap();

    // Act
    pipeline.queue_for_execution(WorkState::new()).await.unwrap();
    pipeline.await_completion().await.unwrap();

    // Assert
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(1, outcomes.len());
    assert!(outcomes[0].is_faulted());
    let state = outcomes[0].value().expect("The faulted state should be handed back");
    assert!(state.is_faulted());
    assert_eq!("boom", state.fault().unwrap().step_name());
    assert_eq!(Some(&Note("tagged")), state.get::<Note>());
    assert_eq!(Some(true), state.step_succeeded("tag"));
    assert_eq!(Some(false), state.step_succeeded("boom"));
    assert!(!state.all_steps_succeeded());
    assert_eq!(0, pipeline.steps()[2].fault_count());
}

#[tokio::test]
async fn a_faulted_item_of_another_type_is_not_handed_back() {
    // Arrange
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::<WorkState, u32>::new(PipelineOptions::new("typed"));
    pipeline
        .add_sync_faultable_step("reject", StepOptions::default(), |_: &mut WorkState| {
            Err(anyhow::anyhow!("rejected"))
        })
        .unwrap()
        .add_sync_step("count", StepOptions::default(), |_: WorkState| {
            Ok::<_, anyhow::Error>(1u32)
        })
        .unwrap();
    pipeline
        .finalize({
            let outcomes = Arc::clone(&outcomes);
            move |processed: Processed<u32>| outcomes.lock().unwrap().push(processed.into_parts())
        })
        .unwrap();

    // Act
    pipeline.queue_for_execution(WorkState::new()).await.unwrap();
    pipeline.await_completion().await.unwrap();

    // Assert
    let outcomes = outcomes.lock().unwrap();
    let (value, fault) = &outcomes[0];
    assert_eq!(None, *value);
    assert_eq!("reject", fault.as_ref().unwrap().step_name());
}
