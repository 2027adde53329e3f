use krnl_runtime::{
    anyhow::Result,
    ash::vk,
    buffer::{Buffer, BufferKind},
    device::{
        sim::{SimCall, SimCommand, SimConfig, SimDriver},
        Device, DeviceOptions, MemoryUsage, WaitTarget,
    },
    error::Error,
    future::BlockableFuture,
    kernel::{ArgDesc, KernelArg, KernelDesc, ModuleDesc},
    launch::LaunchOptions,
};
use paste::paste;
use std::{sync::Arc, time::Duration};

const TIMEOUT: Duration = Duration::from_secs(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sim_device(config: SimConfig) -> Result<(Arc<SimDriver>, Device)> {
    init_tracing();
    let sim = Arc::new(SimDriver::new(config));
    let device = Device::builder().driver(sim.clone()).build()?;
    Ok((sim, device))
}

fn upload<T: bytemuck::Pod>(device: &Device, data: &[T]) -> Result<Buffer<T>> {
    let mut buffer = device.create_buffer(BufferKind::Storage, MemoryUsage::Upload);
    buffer.set_size(data.len())?;
    buffer.map_memory()?.copy_from_slice(data);
    Ok(buffer)
}

fn to_device<T: bytemuck::Pod>(device: &Device, data: &[T]) -> Result<Buffer<T>> {
    let src = upload(device, data)?;
    let mut buffer = device.create_buffer(BufferKind::Storage, MemoryUsage::DeviceOnly);
    buffer.set_size(data.len())?;
    buffer.copy_from(&src, LaunchOptions::new())?.wait(TIMEOUT)?;
    Ok(buffer)
}

fn download<T: bytemuck::Pod>(device: &Device, src: &Buffer<T>) -> Result<Vec<T>> {
    let mut dst = device.create_buffer(BufferKind::Storage, MemoryUsage::Download);
    dst.set_size(src.len())?;
    let result = dst.copy_from(src, LaunchOptions::new().with_fence(true))?;
    result.finish().block()?;
    let data = dst.map_memory()?.to_vec();
    Ok(data)
}

fn saxpy(device: &Device) -> Result<krnl_runtime::kernel::Kernel> {
    let module = ModuleDesc::new("saxpy", vec![0x0723_0203, 0x0001_0300]);
    Ok(device.create_kernel(
        KernelDesc::new("saxpy", module)
            .with_arg(ArgDesc::pod::<f32>())
            .with_arg(ArgDesc::buffer(BufferKind::Storage))
            .with_arg(ArgDesc::buffer_mut(BufferKind::Storage)),
    )?)
}

fn buffer_roundtrip(config: SimConfig) -> Result<()> {
    let (sim, device) = sim_device(config)?;
    for n in [1, 3, 4, 16, 67, 300, 1011] {
        let data: Vec<u32> = (0..n as u32).collect();
        let x = to_device(&device, &data)?;
        assert_eq!(download(&device, &x)?, data);
    }
    assert!(sim.validation_errors().is_empty());
    Ok(())
}

fn saxpy_launches(config: SimConfig) -> Result<()> {
    let (sim, device) = sim_device(config)?;
    let mut kernel = saxpy(&device)?;
    let x = to_device(&device, &[1f32; 1000])?;
    let mut y = to_device(&device, &[0f32; 1000])?;
    let skip = sim.submissions().len();
    for alpha in [2f32, 2., 3.] {
        let result = kernel.run(
            [1000, 1, 1],
            &[
                KernelArg::pod(&alpha),
                KernelArg::buffer(&x),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new().with_fence(true),
        )?;
        assert!(result.is_async());
        result.finish().block()?;
    }
    let group_size = device.info().workgroup_size();
    let groups = 1000 / group_size + u32::from(1000 % group_size != 0);
    let dispatches: Vec<_> = sim
        .submissions()
        .iter()
        .skip(skip)
        .map(|submission| {
            let uploads = submission
                .commands
                .iter()
                .filter(|x| matches!(x, SimCommand::CopyBuffer { .. }))
                .count();
            let dispatch = submission.commands.iter().find_map(|x| match x {
                SimCommand::Dispatch(groups) => Some(*groups),
                _ => None,
            });
            (uploads, dispatch)
        })
        .collect();
    let dispatch = Some([groups, 1, 1]);
    assert_eq!(dispatches, [(1, dispatch), (0, dispatch), (1, dispatch)]);
    assert!(sim.validation_errors().is_empty());
    Ok(())
}

fn fill_then_copy(config: SimConfig) -> Result<()> {
    let (sim, device) = sim_device(config)?;
    let mut x = device.create_buffer::<u8>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    x.set_size(11)?;
    x.fill(0, LaunchOptions::new())?.wait(TIMEOUT)?;
    x.fill(5, LaunchOptions::new().with_dst_offset(3).with_size(5))?
        .wait(TIMEOUT)?;
    let mut y = device.create_buffer::<u8>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    y.set_size(11)?;
    y.copy_from(&x, LaunchOptions::new().with_queue_index(device.info().queues() - 1))?
        .wait(TIMEOUT)?;
    device.wait()?;
    assert_eq!(download(&device, &y)?, [0, 0, 0, 5, 5, 5, 5, 5, 0, 0, 0]);
    assert!(sim.validation_errors().is_empty());
    Ok(())
}

macro_rules! sim_tests {
    ($($name:ident),* $(,)?) => {
        paste! {
            $(
                #[test]
                fn [<$name _discrete>]() -> Result<()> {
                    $name(SimConfig::discrete())
                }
                #[test]
                fn [<$name _unified>]() -> Result<()> {
                    $name(SimConfig::unified())
                }
            )*
        }
    };
}

sim_tests!(buffer_roundtrip, saxpy_launches, fill_then_copy);

#[test]
fn device_from_config() -> Result<()> {
    init_tracing();
    let options: DeviceOptions = serde_json::from_str(
        r#"{ "fence_pool_size": 1, "fence_pool_growth": 2, "debug_labels": false }"#,
    )?;
    let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
    let device = Device::builder()
        .driver(sim.clone())
        .options(options)
        .build()?;
    assert_eq!(device.fence_pool_status().capacity, 1);
    let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    x.set_size(4)?;
    let a = x.fill(1, LaunchOptions::new().with_fence(true))?;
    let b = x.fill(2, LaunchOptions::new().with_fence(true))?;
    assert_eq!(device.fence_pool_status().capacity, 3);
    assert_eq!(device.fence_pool_status().available, 1);
    device.wait_for_completion(WaitTarget::Fence(b.fence().unwrap()))?;
    assert!(a.fence().unwrap().is_signaled()?);
    drop((a, b));
    assert_eq!(device.fence_pool_status().available, 3);
    Ok(())
}

#[test]
fn fence_pool_exhaustion() -> Result<()> {
    init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
    let device = Device::builder()
        .driver(sim.clone())
        .fence_pool_size(1)
        .build()?;
    let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    x.set_size(4)?;
    let held = x.fill(1, LaunchOptions::new().with_fence(true))?;
    let calls = sim.calls().len();
    assert!(matches!(
        x.fill(2, LaunchOptions::new().with_fence(true)),
        Err(Error::ResourceExhausted { capacity: 1 })
    ));
    assert!(!sim.calls()[calls..]
        .iter()
        .any(|x| matches!(x, SimCall::QueueSubmit { .. })));
    drop(held);
    let _ = x.fill(2, LaunchOptions::new().with_fence(true))?;
    Ok(())
}

#[test]
fn submission_failure() -> Result<()> {
    let (sim, device) = sim_device(SimConfig::discrete())?;
    let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    x.set_size(4)?;
    let status = device.fence_pool_status();
    sim.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
    assert!(matches!(
        x.fill(1, LaunchOptions::new().with_fence(true)),
        Err(Error::SubmissionFailed(vk::Result::ERROR_DEVICE_LOST))
    ));
    assert_eq!(device.fence_pool_status(), status);
    x.fill(1, LaunchOptions::new())?.wait(TIMEOUT)?;
    assert_eq!(download(&device, &x)?, [1; 4]);
    Ok(())
}

#[test]
fn resources_outlive_device_handle() -> Result<()> {
    let (sim, device) = sim_device(SimConfig::discrete())?;
    let mut kernel = saxpy(&device)?;
    let x = to_device(&device, &[1f32; 8])?;
    let mut y = to_device(&device, &[1f32; 8])?;
    drop(device);
    let _ = kernel.run(
        [8, 1, 1],
        &[
            KernelArg::pod(&1f32),
            KernelArg::buffer(&x),
            KernelArg::buffer_mut(&mut y),
        ],
        LaunchOptions::new(),
    )?;
    drop((kernel, x, y));
    assert_eq!(sim.live_buffers(), 0);
    assert_eq!(sim.live_memory(), 0);
    assert_eq!(sim.live_command_buffers(), 0);
    assert_eq!(sim.live_pipelines(), 0);
    assert_eq!(sim.live_fences(), 0);
    assert_eq!(sim.live_shader_modules(), 0);
    assert!(sim
        .calls()
        .iter()
        .any(|x| matches!(x, SimCall::DestroyCommandPool(_))));
    assert!(sim.validation_errors().is_empty());
    Ok(())
}

#[test]
fn fence_outlives_device() -> Result<()> {
    let (_sim, device) = sim_device(SimConfig::discrete())?;
    let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
    x.set_size(4)?;
    let fence = x
        .fill(1, LaunchOptions::new().with_fence(true))?
        .into_fence()
        .unwrap();
    drop(x);
    drop(device);
    assert!(fence.is_signaled()?);
    fence.wait(TIMEOUT)?;
    Ok(())
}

#[test]
fn threads_share_device() -> Result<()> {
    let (sim, device) = sim_device(SimConfig::discrete().with_queue_count(4))?;
    let handles: Vec<_> = (0..4usize)
        .map(|queue_index| {
            let device = device.clone();
            std::thread::spawn(move || -> Result<Vec<u32>> {
                let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
                x.set_size(64)?;
                for i in 0..8 {
                    let _ = x.fill(
                        queue_index as u32 * 100 + i,
                        LaunchOptions::new()
                            .with_queue_index(queue_index)
                            .with_fence(i % 2 == 0),
                    )?;
                }
                device.wait_queue(queue_index)?;
                download(&device, &x)
            })
        })
        .collect();
    for (queue_index, handle) in handles.into_iter().enumerate() {
        let data = handle.join().unwrap()?;
        assert_eq!(data, vec![queue_index as u32 * 100 + 7; 64]);
    }
    device.wait()?;
    assert_eq!(device.fence_pool_status().available, 16);
    assert!(sim.validation_errors().is_empty());
    Ok(())
}

#[test]
fn memory_usage_tracks_heaps() -> Result<()> {
    let (_sim, device) = sim_device(SimConfig::discrete())?;
    let x = to_device(&device, &[0u8; 256])?;
    let usage = device.memory_usage();
    assert_eq!(usage[0].allocated, 256);
    // the upload buffer was freed
    assert_eq!(usage[1].allocated, 0);
    assert_eq!(usage[1].peak, 256);
    drop(x);
    assert_eq!(device.memory_usage()[0].allocated, 0);
    Ok(())
}

#[test]
fn device_debug_and_eq() -> Result<()> {
    let (_sim, a) = sim_device(SimConfig::discrete())?;
    let (_sim, b) = sim_device(SimConfig::unified())?;
    assert_eq!(a, a.clone());
    assert_ne!(a, b);
    assert!(format!("{a:?}").starts_with("Device(0@"));
    let x = a.create_buffer::<f32>(BufferKind::Uniform, MemoryUsage::DeviceOnly);
    assert_eq!(x.device(), a);
    Ok(())
}
