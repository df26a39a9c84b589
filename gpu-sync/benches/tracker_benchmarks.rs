use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use redlilium_gpu_sync::{
    AccessFlags, AccessRequest, BarrierBatch, BindingAccess, BufferDesc, CmdInfo,
    CommandBufferId, CommandBufferUsage, DescriptorSet, DummyBackend, ImageLayout,
    PipelineStages, QueueFunction, QueuePriority, RawHandle, ResourceHazardTracker, ResourceId,
    ResourceKind, SubmitInfo, SyncConfig, SyncContext,
};

fn cmd(index: u32, queue: QueueFunction, family: u32) -> CmdInfo {
    CmdInfo::new(CommandBufferId::from_raw_parts(index, 0), queue, family)
}

// ---------------------------------------------------------------------------
// Hazard tracker
// ---------------------------------------------------------------------------

fn bench_write_read_chain(c: &mut Criterion) {
    c.bench_function("tracker_write_read_256_buffers", |b| {
        b.iter(|| {
            let mut tracker = ResourceHazardTracker::new();
            let writer = cmd(0, QueueFunction::Graphics, 0);
            let reader = cmd(1, QueueFunction::Graphics, 0);
            let mut batch = BarrierBatch::new();
            for i in 0..256 {
                let resource = ResourceId::from_raw_parts(i, 0);
                batch.push_opt(tracker.request_access(
                    resource,
                    &AccessRequest::write(
                        writer,
                        PipelineStages::COMPUTE_SHADER,
                        AccessFlags::SHADER_WRITE,
                    ),
                ));
                batch.push_opt(tracker.request_access(
                    resource,
                    &AccessRequest::read(
                        reader,
                        PipelineStages::FRAGMENT_SHADER,
                        AccessFlags::SHADER_READ,
                    ),
                ));
            }
            black_box(batch.into_commands());
        });
    });
}

fn bench_image_layout_churn(c: &mut Criterion) {
    c.bench_function("tracker_layout_churn_64_images", |b| {
        b.iter(|| {
            let mut tracker = ResourceHazardTracker::new();
            let info = cmd(0, QueueFunction::Graphics, 0);
            let mut count = 0;
            for round in 0..4 {
                let layout = if round % 2 == 0 {
                    ImageLayout::TransferDst
                } else {
                    ImageLayout::ShaderReadOnly
                };
                for i in 0..64 {
                    let req = AccessRequest::write(
                        info,
                        PipelineStages::TRANSFER,
                        AccessFlags::TRANSFER_WRITE,
                    )
                    .with_layout(layout);
                    count += usize::from(
                        tracker
                            .request_access(ResourceId::from_raw_parts(i, 0), &req)
                            .is_some(),
                    );
                }
            }
            black_box(count);
        });
    });
}

fn bench_cross_queue_acquire(c: &mut Criterion) {
    c.bench_function("tracker_cross_queue_128_buffers", |b| {
        b.iter(|| {
            let mut tracker = ResourceHazardTracker::new();
            let upload = cmd(0, QueueFunction::Transfer, 2);
            let draw = cmd(1, QueueFunction::Graphics, 0);
            for i in 0..128 {
                let resource = ResourceId::from_raw_parts(i, 0);
                tracker.request_access(
                    resource,
                    &AccessRequest::write(upload, PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE),
                );
                tracker.request_access(
                    resource,
                    &AccessRequest::read(
                        draw,
                        PipelineStages::VERTEX_INPUT,
                        AccessFlags::VERTEX_ATTRIBUTE_READ,
                    ),
                );
            }
            black_box(tracker.get_releases_from_queue(QueueFunction::Transfer));
        });
    });
}

fn bench_clear_finished(c: &mut Criterion) {
    c.bench_function("tracker_clear_finished_32_cmds", |b| {
        b.iter_with_setup(
            || {
                let mut tracker = ResourceHazardTracker::new();
                for i in 0..32u32 {
                    let info = cmd(i, QueueFunction::Graphics, 0);
                    for r in 0..16 {
                        tracker.request_access(
                            ResourceId::from_raw_parts(i * 16 + r, 0),
                            &AccessRequest::write(
                                info,
                                PipelineStages::COMPUTE_SHADER,
                                AccessFlags::SHADER_WRITE,
                            ),
                        );
                    }
                }
                tracker
            },
            |mut tracker| {
                for i in 0..32 {
                    tracker.clear_finished_cmd(CommandBufferId::from_raw_parts(i, 0));
                }
                black_box(tracker);
            },
        );
    });
}

// ---------------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------------

fn bench_record_and_submit(c: &mut Criterion) {
    let mut ctx = SyncContext::with_backend(SyncConfig::default(), Arc::new(DummyBackend::new()));
    let buffers: Vec<ResourceId> = (0..32)
        .filter_map(|_| {
            ctx.create_buffer(BufferDesc::new(ResourceKind::StorageBuffer, 1024))
                .ok()
        })
        .collect();
    let set = buffers.iter().fold(DescriptorSet::new(RawHandle::from_raw(1)), |set, id| {
        set.with_binding(*id, BindingAccess::StorageWrite, PipelineStages::COMPUTE_SHADER)
    });

    c.bench_function("record_submit_finish_32_bindings", |b| {
        b.iter(|| {
            let mut list = ctx.command_list();
            let Ok(cmd) = list.start_cmd("bench", QueueFunction::Compute, CommandBufferUsage::Temporary)
            else {
                return;
            };
            list.barrier_resources(cmd, std::slice::from_ref(&set));
            list.dispatch(cmd, 64, 1, 1);
            let _ = list.end_cmd(cmd);
            let _ = list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None);
            let _ = list.finish_cmd(cmd);
            list.free_cmd(cmd);
        });
    });
}

criterion_group!(
    tracker_benches,
    bench_write_read_chain,
    bench_image_layout_churn,
    bench_cross_queue_acquire,
    bench_clear_finished,
);

criterion_group!(recording_benches, bench_record_and_submit);

criterion_main!(tracker_benches, recording_benches);
