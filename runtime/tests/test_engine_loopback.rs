//! End-to-end engine scenarios against the loopback device

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use neutron_runtime::driver::loopback::ResponsePlan;
use neutron_runtime::model::NpuModelKind;
use neutron_runtime::tensor::DataType;
use neutron_runtime::{Error, InferenceEngine};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn test_single_npu_normal_model() {
    init_tracing();
    let classifier = package(
        &["in"],
        &["out"],
        vec![npu_subgraph(
            "backbone",
            NpuModelKind::Normal,
            vec![tinfo("in", &[1, 3, 224, 224], DataType::Uint8)],
            vec![tinfo("out", &[1, 1000], DataType::Float32)],
        )],
    );
    let file = write_package(&classifier);
    let driver = loopback();
    let logits: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    driver.plan_response(0, ResponsePlan::Normal(logits.clone()));

    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 3), adapters(&[driver]))
            .unwrap();
    assert_eq!(engine.input_size(), 150_528);
    assert_eq!(engine.output_size(), 4000);
    assert_eq!(engine.output_tensor_names(), &["out".to_string()]);

    let input = vec![7u8; 150_528];
    let outputs = engine.run(&input).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].name(), "out");
    assert_eq!(outputs[0].size_in_bytes(), 4000);
    assert_eq!(unsafe { outputs[0].as_slice() }, logits.as_slice());
}

#[test]
fn test_argmax_classifier() {
    init_tracing();
    let model = package(
        &["in"],
        &["argmax"],
        vec![npu_subgraph(
            "classifier",
            NpuModelKind::Argmax,
            vec![tinfo("in", &[1, 3, 224, 224], DataType::Uint8)],
            vec![tinfo("argmax", &[1, 1], DataType::Uint16)],
        )],
    );
    let file = write_package(&model);
    let driver = loopback();
    driver.plan_response(0, ResponsePlan::Argmax(42));

    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();
    let outputs = engine.run(&vec![0u8; 150_528]).unwrap();
    assert_eq!(outputs.len(), 1);
    let raw = unsafe { outputs[0].as_slice() };
    assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), 42);
}

#[test]
fn test_multi_input_two_head_tasks() {
    init_tracing();
    let model = package(
        &["a", "b"],
        &["out_a", "out_b"],
        vec![
            npu_subgraph(
                "branch_a",
                NpuModelKind::Normal,
                vec![tinfo("a", &[1, 3, 64, 64], DataType::Uint8)],
                vec![tinfo("out_a", &[1, 16], DataType::Uint8)],
            ),
            npu_subgraph(
                "branch_b",
                NpuModelKind::Normal,
                vec![tinfo("b", &[1, 3, 64, 64], DataType::Uint8)],
                vec![tinfo("out_b", &[1, 16], DataType::Uint8)],
            ),
        ],
    );
    let file = write_package(&model);
    let driver = loopback();
    driver.plan_response(0, ResponsePlan::Normal(vec![0xA0; 16]));
    driver.plan_response(1, ResponsePlan::Normal(vec![0xB0; 16]));

    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();
    assert!(engine.is_multi_input());

    let buf_a = vec![1u8; 12_288];
    let buf_b = vec![2u8; 12_288];
    let mut inputs: HashMap<&str, &[u8]> = HashMap::new();
    inputs.insert("a", &buf_a);
    inputs.insert("b", &buf_b);
    let outputs = engine.run_multi_input(&inputs).unwrap();

    let names: Vec<&str> = outputs.iter().map(|t| t.name()).collect();
    let declared: Vec<&str> = engine
        .output_tensor_names()
        .iter()
        .map(|s| s.as_str())
        .collect();
    assert_eq!(names, declared);
    assert_eq!(unsafe { outputs[0].as_slice() }, &[0xA0; 16]);
    assert_eq!(unsafe { outputs[1].as_slice() }, &[0xB0; 16]);
}

#[test]
fn test_multi_input_auto_split() {
    init_tracing();
    let model = package(
        &["a", "b"],
        &["out_a", "out_b"],
        vec![
            npu_subgraph(
                "branch_a",
                NpuModelKind::Normal,
                vec![tinfo("a", &[1, 8], DataType::Uint8)],
                vec![tinfo("out_a", &[1, 8], DataType::Uint8)],
            ),
            npu_subgraph(
                "branch_b",
                NpuModelKind::Normal,
                vec![tinfo("b", &[1, 8], DataType::Uint8)],
                vec![tinfo("out_b", &[1, 8], DataType::Uint8)],
            ),
        ],
    );
    let file = write_package(&model);
    let driver = loopback();
    // default Echo plan: each branch reflects its own slice
    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();

    // monolithic buffer of exactly the summed size splits in declared order
    let mut monolithic = vec![0x0Au8; 8];
    monolithic.extend_from_slice(&[0x0Bu8; 8]);
    let outputs = engine.run(&monolithic).unwrap();
    assert_eq!(unsafe { outputs[0].as_slice() }, &[0x0A; 8]);
    assert_eq!(unsafe { outputs[1].as_slice() }, &[0x0B; 8]);

    // any other length is rejected
    let err = engine.run(&vec![0u8; 15]).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_npu_to_cpu_pipeline() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![
            npu_subgraph(
                "feature",
                NpuModelKind::Normal,
                vec![tinfo("in", &[1, 16], DataType::Uint8)],
                vec![tinfo("mid", &[1, 16], DataType::Uint8)],
            ),
            cpu_subgraph(
                "post",
                vec![tinfo("mid", &[1, 16], DataType::Uint8)],
                vec![tinfo("out", &[1, 16], DataType::Uint8)],
            ),
        ],
    );
    let file = write_package(&model);
    let driver = loopback();
    let mid: Vec<u8> = (1..=16).collect();
    driver.plan_response(0, ResponsePlan::Normal(mid.clone()));

    let doubler = factory_of(|inputs, outputs| {
        for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
            for (s, d) in i.data.iter().zip(o.data.iter_mut()) {
                *d = s.wrapping_mul(2);
            }
        }
        Ok(())
    });
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(Some(doubler), 2),
        adapters(&[driver]),
    )
    .unwrap();

    let outputs = engine.run(&vec![9u8; 16]).unwrap();
    let expected: Vec<u8> = mid.iter().map(|&v| v * 2).collect();
    assert_eq!(unsafe { outputs[0].as_slice() }, expected.as_slice());
}

#[test]
fn test_tail_task_writes_into_user_buffer() {
    init_tracing();
    let model = package(
        &["in"],
        &["first", "second"],
        vec![cpu_subgraph(
            "tail",
            vec![tinfo("in", &[1, 8], DataType::Uint8)],
            vec![
                tinfo("first", &[1, 1024], DataType::Uint8),
                tinfo("second", &[1, 512], DataType::Uint8),
            ],
        )],
    );
    let file = write_package(&model);
    let filler = factory_of(|_inputs, outputs| {
        for o in outputs.iter_mut() {
            let value = if o.name == "first" { 0xAA } else { 0xBB };
            o.data.fill(value);
        }
        Ok(())
    });
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(Some(filler), 2),
        Vec::new(),
    )
    .unwrap();

    let input = vec![0u8; 8];
    let mut user_buf = vec![0u8; 1536];
    let outputs = engine.run_into(&input, &mut user_buf, None).unwrap();

    assert!(user_buf[..1024].iter().all(|&b| b == 0xAA));
    assert!(user_buf[1024..].iter().all(|&b| b == 0xBB));
    assert_eq!(outputs[0].data().0 as usize, user_buf.as_ptr() as usize);
    assert_eq!(
        outputs[1].data().0 as usize,
        user_buf.as_ptr() as usize + 1024
    );
    assert!(outputs.iter().all(|t| t.is_user_buffer_mapped()));
}

#[test]
fn test_buffer_pool_backpressure() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![cpu_subgraph(
            "worker",
            vec![tinfo("in", &[1, 8], DataType::Uint8)],
            vec![tinfo("out", &[1, 8], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let factory = {
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        factory_of(move |inputs, outputs| {
            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
                o.data.copy_from_slice(i.data);
            }
            concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let mut options = options_with(Some(factory), 2);
    options.cpu_threads = 6;
    let engine =
        Arc::new(InferenceEngine::open_with_adapters(file.path(), options, Vec::new()).unwrap());

    // submissions block once both buffer-sets are held, so submit from a
    // side thread and wait from here
    let (tx, rx) = std::sync::mpsc::channel();
    let submitter = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            for i in 0..8u8 {
                let id = engine.run_async(&[i; 8], None).unwrap();
                tx.send(id).unwrap();
            }
        })
    };
    let mut done = 0;
    for id in rx {
        let outputs = engine.wait(id).unwrap();
        assert_eq!(outputs.len(), 1);
        done += 1;
    }
    submitter.join().unwrap();
    assert_eq!(done, 8);
    // buffer_count = 2 bounds the in-flight set
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_busy_retry_path() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![npu_subgraph(
            "net",
            NpuModelKind::Normal,
            vec![tinfo("in", &[1, 32], DataType::Uint8)],
            vec![tinfo("out", &[1, 32], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let driver = Arc::new(
        neutron_runtime::driver::loopback::LoopbackDriver::new(16 << 20, 1).with_busy_every(3),
    );
    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();
    for round in 0..6u8 {
        let input = vec![round; 32];
        let outputs = engine.run(&input).unwrap();
        // Echo plan reflects the encoded input
        assert_eq!(unsafe { outputs[0].as_slice() }, input.as_slice());
    }
}

#[test]
fn test_ppu_filtered_output() {
    init_tracing();
    let model = package(
        &["in"],
        &["boxes"],
        vec![npu_subgraph(
            "detector",
            NpuModelKind::Ppu,
            vec![tinfo("in", &[1, 64], DataType::Uint8)],
            vec![tinfo("boxes", &[1, 64], DataType::BBox)],
        )],
    );
    let file = write_package(&model);
    let driver = loopback();
    let payload: Vec<u8> = (0..64 * 32).map(|i| (i % 255) as u8).collect();
    driver.plan_response(
        0,
        ResponsePlan::Ppu {
            filter_num: 5,
            payload: payload.clone(),
        },
    );
    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();
    let outputs = engine.run(&vec![0u8; 64]).unwrap();
    assert_eq!(outputs[0].shape(), &[1, 5]);
    assert_eq!(outputs[0].size_in_bytes(), 5 * 32);
    assert_eq!(unsafe { outputs[0].as_slice() }, &payload[..5 * 32]);
}

#[test]
fn test_ppu_filter_count_is_clamped() {
    init_tracing();
    let model = package(
        &["in"],
        &["boxes"],
        vec![npu_subgraph(
            "detector",
            NpuModelKind::Ppu,
            vec![tinfo("in", &[1, 64], DataType::Uint8)],
            vec![tinfo("boxes", &[1, 64], DataType::BBox)],
        )],
    );
    let file = write_package(&model);
    let driver = loopback();
    // fixture declares ppu_filter_max = 64; the firmware reports far more
    driver.plan_response(
        0,
        ResponsePlan::Ppu {
            filter_num: 500,
            payload: vec![0x5A; 64 * 32],
        },
    );
    let engine =
        InferenceEngine::open_with_adapters(file.path(), options_with(None, 2), adapters(&[driver]))
            .unwrap();

    let clamp_events = Arc::new(AtomicUsize::new(0));
    {
        let clamp_events = Arc::clone(&clamp_events);
        engine.register_event_handler(move |event| {
            if event.code == neutron_runtime::events::EventCode::PpuFilterClamped {
                clamp_events.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let outputs = engine.run(&vec![0u8; 64]).unwrap();
    // shape never exceeds the declared maximum or the buffer capacity
    assert_eq!(outputs[0].shape(), &[1, 64]);
    assert_eq!(outputs[0].size_in_bytes(), 64 * 32);
    assert_eq!(clamp_events.load(Ordering::SeqCst), 1);
}

#[test]
fn test_validate_device_pins_one_device() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![npu_subgraph(
            "net",
            NpuModelKind::Normal,
            vec![tinfo("in", &[1, 8], DataType::Uint8)],
            vec![tinfo("out", &[1, 8], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let dev0 = loopback();
    let dev1 = loopback();
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(None, 2),
        adapters(&[Arc::clone(&dev0), Arc::clone(&dev1)]),
    )
    .unwrap();

    let runs_before = dev1
        .command_log()
        .iter()
        .filter(|c| matches!(c, neutron_runtime::driver::DeviceCommand::NpuRunReq))
        .count();
    engine.validate_device(&[3u8; 8], 1).unwrap();
    let runs_after = dev1
        .command_log()
        .iter()
        .filter(|c| matches!(c, neutron_runtime::driver::DeviceCommand::NpuRunReq))
        .count();
    assert_eq!(runs_after, runs_before + 1);

    let err = engine.validate_device(&[3u8; 8], 9).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_run_batch_preserves_order() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![cpu_subgraph(
            "identity",
            vec![tinfo("in", &[1, 4], DataType::Uint8)],
            vec![tinfo("out", &[1, 4], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let copy = factory_of(|inputs, outputs| {
        for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
            o.data.copy_from_slice(i.data);
        }
        Ok(())
    });
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(Some(copy), 4),
        Vec::new(),
    )
    .unwrap();

    let inputs: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 4]).collect();
    let input_refs: Vec<&[u8]> = inputs.iter().map(|v| v.as_slice()).collect();
    let mut outputs: Vec<Vec<u8>> = (0..10).map(|_| vec![0u8; 4]).collect();
    let mut output_refs: Vec<&mut [u8]> =
        outputs.iter_mut().map(|v| v.as_mut_slice()).collect();

    let results = engine
        .run_batch(&input_refs, &mut output_refs, &[])
        .unwrap();
    assert_eq!(results.len(), 10);
    for (i, out) in outputs.iter().enumerate() {
        assert_eq!(out.as_slice(), &[i as u8; 4]);
    }
}

#[test]
fn test_unknown_tensor_name_rejected() {
    init_tracing();
    let model = package(
        &["a", "b"],
        &["out_a", "out_b"],
        vec![
            npu_subgraph(
                "branch_a",
                NpuModelKind::Normal,
                vec![tinfo("a", &[1, 8], DataType::Uint8)],
                vec![tinfo("out_a", &[1, 8], DataType::Uint8)],
            ),
            npu_subgraph(
                "branch_b",
                NpuModelKind::Normal,
                vec![tinfo("b", &[1, 8], DataType::Uint8)],
                vec![tinfo("out_b", &[1, 8], DataType::Uint8)],
            ),
        ],
    );
    let file = write_package(&model);
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(None, 2),
        adapters(&[loopback()]),
    )
    .unwrap();

    let buf = vec![0u8; 8];
    let mut inputs: HashMap<&str, &[u8]> = HashMap::new();
    inputs.insert("a", &buf);
    inputs.insert("zzz", &buf);
    let err = engine.run_multi_input(&inputs).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_callback_observes_completion() {
    init_tracing();
    let model = package(
        &["in"],
        &["out"],
        vec![cpu_subgraph(
            "identity",
            vec![tinfo("in", &[1, 4], DataType::Uint8)],
            vec![tinfo("out", &[1, 4], DataType::Uint8)],
        )],
    );
    let file = write_package(&model);
    let copy = factory_of(|inputs, outputs| {
        for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
            o.data.copy_from_slice(i.data);
        }
        Ok(())
    });
    let engine = InferenceEngine::open_with_adapters(
        file.path(),
        options_with(Some(copy), 2),
        Vec::new(),
    )
    .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        engine.register_callback(move |outputs, _arg| {
            assert_eq!(outputs.len(), 1);
            seen.fetch_add(1, Ordering::SeqCst);
            0
        });
    }
    engine.run_async(&[5u8; 4], None).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while seen.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
