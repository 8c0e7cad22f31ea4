//! Dynamic CPU worker scaling under sustained load

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use neutron_runtime::tensor::DataType;
use neutron_runtime::{InferenceEngine, RuntimeConfig};

fn engine_with_dynamic_threads(buffer_count: usize) -> Arc<InferenceEngine> {
    let model = package(
        &["in"],
        &["out"],
        vec![cpu_subgraph(
            "slow",
            vec![tinfo("in", &[1, 8], DataType::Uint8)],
            vec![tinfo("out", &[1, 8], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let slow_copy = factory_of(|inputs, outputs| {
        std::thread::sleep(Duration::from_millis(10));
        for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
            o.data.copy_from_slice(i.data);
        }
        Ok(())
    });
    let mut options = options_with(Some(slow_copy), buffer_count);
    options.cpu_threads = 1;
    options.runtime = Some(RuntimeConfig {
        dynamic_cpu_thread: true,
        ..RuntimeConfig::default()
    });
    Arc::new(InferenceEngine::open_with_adapters(file.path(), options, Vec::new()).unwrap())
}

fn thread_count(engine: &InferenceEngine) -> usize {
    engine
        .cpu_worker_threads()
        .first()
        .map(|(_, n)| *n)
        .unwrap_or(0)
}

#[test]
fn test_pool_grows_under_load_and_returns_to_baseline() {
    let engine = engine_with_dynamic_threads(16);
    let baseline = thread_count(&engine);
    assert_eq!(baseline, 1);

    // sustained submissions: 10 ms per request against one thread piles the
    // queue up and must grow the pool within a second
    let submitter = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            let mut job_ids = Vec::with_capacity(128);
            for i in 0..128u8 {
                job_ids.push(engine.run_async(&[i; 8], None).unwrap());
            }
            job_ids
        })
    };

    let mut grew = false;
    let grow_deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < grow_deadline {
        if thread_count(&engine) > baseline {
            grew = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    // every submission completes with its declared output
    let job_ids = submitter.join().unwrap();
    for (i, id) in job_ids.into_iter().enumerate() {
        let outputs = engine.wait(id).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(unsafe { outputs[0].as_slice() }, &[i as u8; 8]);
    }
    assert!(grew, "worker pool never grew above the static baseline");

    // the controller samples on the submit path; a light trickle after the
    // queue empties drives the retire decisions (one thread retires per
    // sustained idle interval, so draining the whole pool takes a few of
    // them)
    let mut returned = false;
    let shrink_deadline = Instant::now() + Duration::from_secs(8);
    while Instant::now() < shrink_deadline {
        let _ = engine.run(&[0u8; 8]).unwrap();
        if thread_count(&engine) <= baseline {
            returned = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(returned, "worker pool did not return to the baseline");
}

#[test]
fn test_static_mode_never_scales() {
    let model = package(
        &["in"],
        &["out"],
        vec![cpu_subgraph(
            "static",
            vec![tinfo("in", &[1, 8], DataType::Uint8)],
            vec![tinfo("out", &[1, 8], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let copy = factory_of(|inputs, outputs| {
        for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
            o.data.copy_from_slice(i.data);
        }
        Ok(())
    });
    let mut options = options_with(Some(copy), 8);
    options.cpu_threads = 2;
    let engine =
        Arc::new(InferenceEngine::open_with_adapters(file.path(), options, Vec::new()).unwrap());
    assert_eq!(thread_count(&engine), 2);

    let buf = vec![1u8; 8];
    for _ in 0..32 {
        engine.run(&buf).unwrap();
    }
    assert_eq!(thread_count(&engine), 2);
}
