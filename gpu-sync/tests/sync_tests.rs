//! Integration tests for automatic synchronization.
//!
//! Every test records through the public command list and checks the exact
//! barriers and submissions the dummy backend saw.

mod common;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use common::{
    Backend, GRAPHICS_FAMILY, TRANSFER_FAMILY, TestContext, barrier_groups, barriers_for,
    command_kinds,
};
use redlilium_gpu_sync::{
    AccessFlags, BindingAccess, BufferCopy, CommandBufferId, CommandBufferState,
    CommandBufferUsage, DescriptorSet, Extent3d, ImageDesc, ImageFormat, ImageLayout,
    ImageRegion, MipRange, MipUpload, NativeCommand, Offset3d, PipelineBindPoint,
    PipelineStages, QueueFunction, QueuePriority, RawHandle, RenderPassAttachment,
    RenderPassBegin, ResourceId, SubmitInfo, SyncConfig,
};
use rstest::rstest;

fn storage_write(resource: ResourceId) -> DescriptorSet {
    DescriptorSet::new(RawHandle::from_raw(1)).with_binding(
        resource,
        BindingAccess::StorageWrite,
        PipelineStages::COMPUTE_SHADER,
    )
}

fn color_pass(image: ResourceId, initial: ImageLayout, final_layout: ImageLayout) -> RenderPassBegin {
    RenderPassBegin {
        render_pass: RawHandle::from_raw(10),
        framebuffer: RawHandle::from_raw(11),
        extent: Extent3d::new_2d(16, 16),
        clear_values: Vec::new(),
        attachments: vec![RenderPassAttachment {
            image,
            initial_layout: initial,
            final_layout,
            is_depth: false,
        }],
        presents: None,
    }
}

/// Record a compute write of `buffer` on the graphics queue and submit it.
fn submit_compute_write(t: &mut TestContext, name: &str, buffer: ResourceId) -> CommandBufferId {
    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd(name, QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.barrier_resources(cmd, &[storage_write(buffer)]);
    list.dispatch(cmd, 1, 1, 1);
    list.end_cmd(cmd).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None)
        .unwrap();
    cmd
}

/// Record the graphics queue's pending releases towards `target` and submit.
fn submit_release(t: &mut TestContext, target: QueueFunction) -> CommandBufferId {
    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("release", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.release_queue_resources(cmd, target, &HashMap::new());
    list.end_cmd(cmd).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None)
        .unwrap();
    cmd
}

// ============================================================================
// Cross-queue hazards
// ============================================================================

#[rstest]
#[case::dedicated_families(Backend::Dummy)]
#[case::single_family(Backend::DummySingleFamily)]
fn test_transfer_read_after_compute_write(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let dst = t.storage_buffer(256);

    let writer = submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
    list.end_cmd(reader).unwrap();

    let log = t.log(reader);
    assert_eq!(command_kinds(&log.commands), vec!["barrier", "copy_buffer"]);
    let NativeCommand::PipelineBarrier {
        by_region,
        barriers,
        ..
    } = &log.commands[0]
    else {
        panic!("expected a barrier first, got {:?}", log.commands[0]);
    };
    assert_eq!(barriers.len(), 1);
    let barrier = barriers[0];
    assert_eq!(barrier.resource, src);
    assert_eq!(barrier.src_stage, PipelineStages::COMPUTE_SHADER);
    assert_eq!(
        barrier.src_access,
        AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE
    );
    assert_eq!(barrier.dst_stage, PipelineStages::TRANSFER);
    assert_eq!(barrier.dst_access, AccessFlags::TRANSFER_READ);
    assert_eq!(barrier.old_layout, None);

    let transfer_family = if backend.has_transfer_family() {
        TRANSFER_FAMILY
    } else {
        GRAPHICS_FAMILY
    };
    assert_eq!(barrier.src_queue_family, GRAPHICS_FAMILY);
    assert_eq!(barrier.dst_queue_family, transfer_family);
    assert_eq!(*by_region, !backend.has_transfer_family());

    let pending = t.ctx.tracker().pending_release(QueueFunction::Graphics, src);
    if backend.has_transfer_family() {
        let pending = pending.expect("the graphics queue owes a release");
        assert!(pending.acquired);
        assert_eq!(pending.dst_family, Some(TRANSFER_FAMILY));
        assert_eq!(pending.stages, PipelineStages::COMPUTE_SHADER);
    } else {
        assert!(pending.is_none());
    }
    assert_eq!(t.ctx.tracker().last_writer(src), Some(writer));
    assert_eq!(t.ctx.tracker().readers(src), vec![reader]);

    if backend.has_transfer_family() {
        submit_release(&mut t, QueueFunction::Transfer);
    }
    t.ctx
        .command_list()
        .submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();

    let submissions = t.submissions();
    let writer_signal = *submissions[0].signal_semaphores.last().unwrap();
    let mut expected_waits = vec![(writer_signal, PipelineStages::TRANSFER)];
    if backend.has_transfer_family() {
        assert_eq!(submissions.len(), 3);
        let release_signal = *submissions[1].signal_semaphores.last().unwrap();
        expected_waits.push((release_signal, PipelineStages::TRANSFER));
    } else {
        assert_eq!(submissions.len(), 2);
    }
    let read = submissions.last().unwrap();
    assert_eq!(read.wait_semaphores, expected_waits);
    assert_eq!(read.queue, QueueFunction::Transfer);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_release_recorded_on_owning_queue(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let dst = t.storage_buffer(256);
    submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
    list.end_cmd(reader).unwrap();

    // The acquire in r1 already names the transfer family.
    let release = submit_release(&mut t, QueueFunction::Graphics);
    t.ctx
        .command_list()
        .submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();

    let submissions = t.submissions();
    assert_eq!(submissions.len(), 3);
    let release_signal = *submissions[1].signal_semaphores.last().unwrap();
    assert!(
        submissions[2]
            .wait_semaphores
            .contains(&(release_signal, PipelineStages::TRANSFER))
    );

    let log = t.log(release);
    let barriers = barriers_for(&log.commands, src);
    assert_eq!(barriers.len(), 1);
    let barrier = barriers[0];
    assert_eq!(barrier.src_queue_family, GRAPHICS_FAMILY);
    assert_eq!(barrier.dst_queue_family, TRANSFER_FAMILY);
    assert_eq!(barrier.src_stage, PipelineStages::COMPUTE_SHADER);
    assert_eq!(barrier.dst_stage, PipelineStages::BOTTOM_OF_PIPE);
    assert!(barrier.dst_access.is_empty());
    assert!(
        t.ctx
            .tracker()
            .pending_release(QueueFunction::Graphics, src)
            .is_none()
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_immediate_copy_releases_from_owning_queue(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let dst = t.storage_buffer(256);
    submit_compute_write(&mut t, "w1", src);

    t.ctx
        .command_list()
        .copy_buffer(src, dst, &[BufferCopy::new(0, 0, 64)])
        .unwrap();

    let release = t.log_named("queue_release");
    assert_eq!(release.queue, Some(QueueFunction::Graphics));
    assert!(release.freed);
    let released = barriers_for(&release.commands, src);
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].src_queue_family, GRAPHICS_FAMILY);
    assert_eq!(released[0].dst_queue_family, TRANSFER_FAMILY);

    let acquired = barriers_for(&t.log_named("copy_buffer").commands, src);
    assert_eq!(acquired[0].src_queue_family, GRAPHICS_FAMILY);
    assert_eq!(acquired[0].dst_queue_family, TRANSFER_FAMILY);

    // The release took the writer's signal, the copy waited on its fence.
    let submissions = t.submissions();
    assert_eq!(submissions.len(), 3);
    let writer_signal = *submissions[0].signal_semaphores.last().unwrap();
    assert_eq!(
        submissions[1].wait_semaphores,
        vec![(writer_signal, PipelineStages::COMPUTE_SHADER)]
    );
    assert!(submissions[2].wait_semaphores.is_empty());
    assert!(
        t.ctx
            .tracker()
            .pending_release(QueueFunction::Graphics, src)
            .is_none()
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_disabled_queue_transfers(#[case] backend: Backend) {
    let mut t = TestContext::with_config(backend, SyncConfig::default().with_queue_transfers(false));
    let src = t.storage_buffer(128);
    let dst = t.storage_buffer(128);
    submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
    list.end_cmd(reader).unwrap();

    let log = t.log(reader);
    assert_eq!(log.family, GRAPHICS_FAMILY);
    for barrier in barrier_groups(&log.commands).into_iter().flatten() {
        assert!(!barrier.is_queue_transfer(), "unexpected transfer {barrier:?}");
    }
    assert!(
        t.ctx
            .tracker()
            .pending_release(QueueFunction::Graphics, src)
            .is_none()
    );
}

#[rstest]
#[case::dedicated_families(Backend::Dummy)]
#[case::single_family(Backend::DummySingleFamily)]
fn test_upload_then_vertex_read_acquires_once(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let vertices = t.vertex_buffer(256);
    t.ctx
        .command_list()
        .copy_to_buffer(vertices, 0, &[7u8; 256])
        .unwrap();

    let upload = t.log_named("copy_buffers");
    assert!(upload.freed);
    let released = barriers_for(&upload.commands, vertices);
    if backend.has_transfer_family() {
        assert_eq!(upload.queue, Some(QueueFunction::Transfer));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].src_queue_family, TRANSFER_FAMILY);
        assert_eq!(released[0].dst_queue_family, GRAPHICS_FAMILY);
    } else {
        assert!(released.is_empty());
    }

    let mut list = t.ctx.command_list();
    let draw = list
        .start_cmd("draw", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.barrier_vertices(draw, &[vertices]);
    list.barrier_vertices(draw, &[vertices]);
    list.end_cmd(draw).unwrap();

    let acquired = barriers_for(&t.log(draw).commands, vertices);
    if backend.has_transfer_family() {
        assert_eq!(acquired.len(), 1);
        let barrier = acquired[0];
        assert_eq!(barrier.src_queue_family, TRANSFER_FAMILY);
        assert_eq!(barrier.dst_queue_family, GRAPHICS_FAMILY);
        assert_eq!(barrier.dst_stage, PipelineStages::VERTEX_INPUT);
        assert_eq!(barrier.dst_access, AccessFlags::VERTEX_ATTRIBUTE_READ);
    } else {
        assert!(acquired.is_empty());
    }
}

// ============================================================================
// Submission
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::single_family(Backend::DummySingleFamily)]
fn test_same_queue_dependency_skips_semaphore(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);
    let writer = submit_compute_write(&mut t, "w1", buffer);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.barrier_vertices(reader, &[buffer]);
    list.end_cmd(reader).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();

    assert_eq!(t.ctx.tracker().cmd_dependencies(reader)[0].cmd, writer);
    assert!(t.submissions()[1].wait_semaphores.is_empty());
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_manual_wait_uses_all_commands(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);
    let writer = submit_compute_write(&mut t, "w1", buffer);

    let mut list = t.ctx.command_list();
    let other = list
        .start_cmd("unrelated", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.end_cmd(other).unwrap();
    list.submit_cmd(
        QueuePriority::Medium,
        &SubmitInfo::single(other).wait_on(writer),
        None,
    )
    .unwrap();

    let submissions = t.submissions();
    let writer_signal = *submissions[0].signal_semaphores.last().unwrap();
    assert_eq!(
        submissions[1].wait_semaphores,
        vec![(writer_signal, PipelineStages::ALL_COMMANDS)]
    );
}

#[rstest]
#[case::single_family(Backend::DummySingleFamily)]
fn test_second_reader_waits_on_producer_fence(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let first_dst = t.storage_buffer(256);
    let second_dst = t.storage_buffer(256);
    let writer = submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let mut readers = Vec::new();
    for (name, dst) in [("r1", first_dst), ("r2", second_dst)] {
        let reader = list
            .start_cmd(name, QueueFunction::Transfer, CommandBufferUsage::OneTime)
            .unwrap();
        list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
        list.end_cmd(reader).unwrap();
        readers.push(reader);
    }
    for &reader in &readers {
        assert_eq!(list.tracker().cmd_dependencies(reader)[0].cmd, writer);
        list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
            .unwrap();
    }

    let submissions = t.submissions();
    assert_eq!(submissions.len(), 3);
    let writer_signal = *submissions[0].signal_semaphores.last().unwrap();
    assert_eq!(
        submissions[1].wait_semaphores,
        vec![(writer_signal, PipelineStages::TRANSFER)]
    );
    assert!(submissions[2].wait_semaphores.is_empty());
    assert!(
        t.ctx
            .registry()
            .get(writer)
            .unwrap()
            .signal_semaphore()
            .is_none()
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_present_skips_signal_taken_by_dependent(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let target = t.color_target(16);
    let swapchain = RawHandle::from_raw(99);

    let mut list = t.ctx.command_list();
    let frame = list
        .start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    let mut pass = color_pass(target, ImageLayout::Undefined, ImageLayout::PresentSrc);
    pass.presents = Some(swapchain);
    list.begin_render_pass(frame, pass);
    list.end_render_pass(frame);
    list.end_cmd(frame).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(frame), None)
        .unwrap();

    let after = list
        .start_cmd("after", QueueFunction::Compute, CommandBufferUsage::OneTime)
        .unwrap();
    list.end_cmd(after).unwrap();
    list.submit_cmd(
        QueuePriority::Medium,
        &SubmitInfo::single(after).wait_on(frame),
        None,
    )
    .unwrap();

    list.present_image(&[swapchain], &[0], &[]).unwrap();
    assert_eq!(t.backend.presents(), vec![vec![0]]);
    assert_eq!(t.backend.present_waits(), vec![Vec::<u64>::new()]);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_acquire_submitted_only_after_release(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let dst = t.storage_buffer(256);
    submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
    list.end_cmd(reader).unwrap();

    // No release on the graphics queue yet.
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();
    assert_eq!(list.registry().state(reader), Some(CommandBufferState::Ended));
    assert_eq!(t.submissions().len(), 1);

    let mut list = t.ctx.command_list();
    let release = list
        .start_cmd("release", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.release_queue_resources(release, QueueFunction::Transfer, &HashMap::new());
    list.end_cmd(release).unwrap();
    assert!(
        list.tracker()
            .cmd_dependencies(reader)
            .iter()
            .any(|dep| dep.cmd == release)
    );

    // Recorded but not submitted: still refused.
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();
    assert_eq!(list.registry().state(reader), Some(CommandBufferState::Ended));

    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(release), None)
        .unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();
    assert_eq!(list.registry().state(reader), Some(CommandBufferState::Submitted));

    let submissions = t.submissions();
    assert_eq!(submissions.len(), 3);
    let release_signal = *submissions[1].signal_semaphores.last().unwrap();
    assert!(
        submissions[2]
            .wait_semaphores
            .contains(&(release_signal, PipelineStages::TRANSFER))
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_acquire_after_release_depends_on_it(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(256);
    let dst = t.storage_buffer(256);
    submit_compute_write(&mut t, "w1", src);
    let release = submit_release(&mut t, QueueFunction::Transfer);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 64)]);
    list.end_cmd(reader).unwrap();
    assert!(
        list.tracker()
            .cmd_dependencies(reader)
            .iter()
            .any(|dep| dep.cmd == release)
    );
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();

    let submissions = t.submissions();
    let release_signal = *submissions[1].signal_semaphores.last().unwrap();
    assert!(
        submissions[2]
            .wait_semaphores
            .contains(&(release_signal, PipelineStages::TRANSFER))
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_unsubmitted_buffer_is_discarded_not_finished(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);

    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("w1", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.barrier_resources(cmd, &[storage_write(buffer)]);
    list.dispatch(cmd, 1, 1, 1);
    list.end_cmd(cmd).unwrap();

    list.finish_cmd(cmd).unwrap();
    assert_eq!(list.registry().state(cmd), Some(CommandBufferState::Ended));
    assert!(list.tracker().references_cmd(cmd));

    list.discard_cmd(cmd).unwrap();
    assert!(!t.ctx.registry().contains(cmd));
    assert!(!t.ctx.tracker().references_cmd(cmd));
    assert!(t.ctx.tracker().last_writer(buffer).is_none());
    assert_eq!(t.backend.live_command_buffers(), 0);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_finish_clears_tracker_references(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);
    let cmd = submit_compute_write(&mut t, "w1", buffer);
    assert!(t.ctx.tracker().references_cmd(cmd));
    assert!(t.ctx.tracker().has_cmds_using_resource(buffer));

    let mut list = t.ctx.command_list();
    list.finish_cmd(cmd).unwrap();
    assert_eq!(list.registry().state(cmd), Some(CommandBufferState::Finished));
    assert!(!list.tracker().references_cmd(cmd));
    assert!(!list.has_cmds_using_resource(buffer));

    list.free_cmd(cmd);
    assert!(!t.ctx.registry().contains(cmd));
    assert_eq!(t.ctx.stats().finished, 1);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_free_before_finish_panics(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);
    let cmd = submit_compute_write(&mut t, "w1", buffer);

    let freed = catch_unwind(AssertUnwindSafe(|| t.ctx.command_list().free_cmd(cmd)));
    assert!(freed.is_err());
    assert_eq!(t.ctx.registry().state(cmd), Some(CommandBufferState::Submitted));

    let mut list = t.ctx.command_list();
    list.finish_cmd(cmd).unwrap();
    list.free_cmd(cmd);
    assert_eq!(t.backend.live_command_buffers(), 0);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_wait_on_resource_dependencies(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let buffer = t.storage_buffer(64);
    let cmd = submit_compute_write(&mut t, "w1", buffer);

    t.ctx.command_list().wait_on_res_dep_cmds(buffer).unwrap();
    assert_eq!(t.ctx.registry().state(cmd), Some(CommandBufferState::Finished));
    assert!(!t.ctx.tracker().has_cmds_using_resource(buffer));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_finishing_producer_finishes_dependents(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.storage_buffer(64);
    let dst = t.storage_buffer(64);
    let writer = submit_compute_write(&mut t, "w1", src);

    let mut list = t.ctx.command_list();
    let reader = list
        .start_cmd("r1", QueueFunction::Transfer, CommandBufferUsage::OneTime)
        .unwrap();
    list.cmd_copy_buffer(reader, src, dst, &[BufferCopy::new(0, 0, 32)]);
    list.end_cmd(reader).unwrap();
    submit_release(&mut t, QueueFunction::Transfer);

    let mut list = t.ctx.command_list();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(reader), None)
        .unwrap();

    list.finish_cmd(writer).unwrap();
    assert_eq!(list.registry().state(reader), Some(CommandBufferState::Finished));
    assert!(!list.tracker().references_cmd(reader));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_reusable_buffer_rerecorded_after_finish(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let mut list = t.ctx.command_list();
    let first = list
        .start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::Reusable)
        .unwrap();
    list.end_cmd(first).unwrap();
    list.submit_wait_cmd(QueuePriority::Medium, first).unwrap();

    let second = list
        .start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::Reusable)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(list.registry().state(second), Some(CommandBufferState::Recording));
    list.end_cmd(second).unwrap();
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[should_panic(expected = "recorded again before finish")]
fn test_reusable_buffer_rerecorded_while_submitted(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::Reusable)
        .unwrap();
    list.end_cmd(cmd).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None)
        .unwrap();
    let _ = list.start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::Reusable);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_present_after_swapchain_render(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let target = t.color_target(16);
    let swapchain = RawHandle::from_raw(99);

    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("frame", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    let mut pass = color_pass(target, ImageLayout::Undefined, ImageLayout::PresentSrc);
    pass.presents = Some(swapchain);
    list.begin_render_pass(cmd, pass);
    list.draw_vertices(cmd, 3, 1, 0, 0);
    list.end_render_pass(cmd);
    list.end_cmd(cmd).unwrap();
    list.submit_cmd(QueuePriority::Medium, &SubmitInfo::single(cmd), None)
        .unwrap();
    assert!(list.registry().get(cmd).unwrap().writes_swapchain());

    list.present_image(&[swapchain], &[2], &[]).unwrap();
    assert!(!list.registry().get(cmd).unwrap().writes_swapchain());
    assert_eq!(t.backend.presents(), vec![vec![2]]);
}

// ============================================================================
// Image uploads and layouts
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::single_family(Backend::DummySingleFamily)]
fn test_upload_generates_mip_chain(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let texture = t.texture(8, 4);
    t.ctx
        .command_list()
        .copy_to_image(texture, &[0u8; 256], MipUpload::Generate)
        .unwrap();

    let log = t.log_named("copy_to_image");
    assert_eq!(log.queue, Some(QueueFunction::Graphics));
    assert_eq!(
        command_kinds(&log.commands),
        vec![
            "barrier",
            "copy_buffer_to_image",
            "barrier",
            "blit",
            "barrier",
            "blit",
            "barrier",
            "blit",
            "barrier",
        ]
    );

    let groups = barrier_groups(&log.commands);
    let upload = groups[0][0];
    assert_eq!(upload.old_layout, Some(ImageLayout::Undefined));
    assert_eq!(upload.new_layout, Some(ImageLayout::TransferDst));
    assert_eq!(upload.mips, Some(MipRange::new(0, 4)));
    assert_eq!(upload.src_stage, PipelineStages::TOP_OF_PIPE);

    for (level, group) in groups[1..4].iter().enumerate() {
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].mips, Some(MipRange::single(level as u32)));
        assert_eq!(group[0].old_layout, Some(ImageLayout::TransferDst));
        assert_eq!(group[0].new_layout, Some(ImageLayout::TransferSrc));
    }

    let finals = &groups[4];
    assert_eq!(finals.len(), 2);
    assert_eq!(finals[0].mips, Some(MipRange::single(3)));
    assert_eq!(finals[0].old_layout, Some(ImageLayout::TransferDst));
    assert_eq!(finals[1].mips, Some(MipRange::new(0, 3)));
    assert_eq!(finals[1].old_layout, Some(ImageLayout::TransferSrc));
    assert!(
        finals
            .iter()
            .all(|b| b.new_layout == Some(ImageLayout::ShaderReadOnly))
    );

    assert_eq!(
        t.ctx.tracker().current_layout(texture),
        Some(ImageLayout::ShaderReadOnly)
    );
    assert!(t.ctx.registry().is_empty());
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_upload_rejects_short_data(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let texture = t.texture(8, 1);
    t.ctx
        .command_list()
        .copy_to_image(texture, &[0u8; 16], MipUpload::BaseOnly)
        .unwrap();
    assert!(t.backend.command_log_named("copy_to_image").is_none());
    assert_eq!(
        t.ctx.tracker().current_layout(texture),
        Some(ImageLayout::Undefined)
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_clear_returns_to_resting_layout(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let texture = t.texture(4, 1);
    t.ctx
        .command_list()
        .clear_image(texture, [0.0, 0.0, 0.0, 1.0], &[])
        .unwrap();

    let log = t.log_named("clear_image");
    assert_eq!(
        command_kinds(&log.commands),
        vec!["barrier", "clear_color", "barrier"]
    );
    let groups = barrier_groups(&log.commands);
    assert_eq!(groups[0][0].new_layout, Some(ImageLayout::TransferDst));
    assert_eq!(groups[1][0].old_layout, Some(ImageLayout::TransferDst));
    assert_eq!(groups[1][0].new_layout, Some(ImageLayout::ShaderReadOnly));
    assert_eq!(
        t.ctx.tracker().current_layout(texture),
        Some(ImageLayout::ShaderReadOnly)
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_initial_layouts_batched(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let a = t.texture(4, 1);
    let b = t.texture(8, 2);
    t.ctx.command_list().setup_initial_layouts(&[a, b]).unwrap();

    let groups = barrier_groups(&t.log_named("initial_layout").commands);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 2);
    assert!(
        groups[0]
            .iter()
            .all(|barrier| barrier.old_layout == Some(ImageLayout::Undefined))
    );
    assert_eq!(t.ctx.tracker().current_layout(b), Some(ImageLayout::ShaderReadOnly));
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[should_panic(expected = "Mip counts and extents must match")]
fn test_copy_with_mismatched_mips_panics(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let src = t.texture(8, 2);
    let dst = t.texture(8, 1);
    let src_desc = ImageDesc::new_2d(8, 8, ImageFormat::Rgba8Unorm).with_mip_levels(2);
    let dst_desc = ImageDesc::new_2d(8, 8, ImageFormat::Rgba8Unorm);
    let _ = t.ctx.command_list().copy_or_resolve_image(
        src,
        dst,
        ImageRegion::whole(&src_desc),
        ImageRegion::whole(&dst_desc),
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_copy_within_image_uses_general(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let image = t.texture(64, 1);
    t.ctx.command_list().setup_initial_layout(image).unwrap();

    let desc = ImageDesc::new_2d(64, 64, ImageFormat::Rgba8Unorm);
    let left = ImageRegion::whole(&desc).with_extent(Extent3d::new_2d(32, 64));
    let right = left.with_offset(Offset3d::new(32, 0, 0));
    t.ctx
        .command_list()
        .copy_or_resolve_image(image, image, left, right)
        .unwrap();

    let log = t.log_named("copy_image");
    let copy = log
        .commands
        .iter()
        .find_map(|c| match c {
            NativeCommand::CopyImage {
                src_layout,
                dst_layout,
                ..
            } => Some((*src_layout, *dst_layout)),
            _ => None,
        })
        .expect("a copy was recorded");
    assert_eq!(copy, (ImageLayout::General, ImageLayout::General));
    assert_eq!(
        t.ctx.tracker().current_layout(image),
        Some(ImageLayout::ShaderReadOnly)
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[should_panic(expected = "overlapping region")]
fn test_copy_between_shifted_mips_of_one_image_panics(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let image = t.texture(16, 3);
    t.ctx.command_list().setup_initial_layout(image).unwrap();

    // Mip 1 is written by the first copy and read by the second.
    let desc = ImageDesc::new_2d(16, 16, ImageFormat::Rgba8Unorm).with_mip_levels(3);
    let whole = ImageRegion::whole(&desc);
    let _ = t.ctx.command_list().copy_or_resolve_image(
        image,
        image,
        whole.with_mips(MipRange::new(0, 2)),
        whole.with_mips(MipRange::new(1, 2)),
    );
}

#[rstest]
#[case::dedicated_families(Backend::Dummy)]
#[case::single_family(Backend::DummySingleFamily)]
fn test_failed_upload_discards_temporary_buffer(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let vertices = t.vertex_buffer(64);

    t.backend.fail_next_submits(1);
    let result = t.ctx.command_list().copy_to_buffer(vertices, 0, &[1u8; 64]);
    assert!(result.is_err());

    assert!(t.log_named("copy_buffers").freed);
    assert!(t.ctx.registry().is_empty());
    assert!(!t.ctx.tracker().has_cmds_using_resource(vertices));
    assert_eq!(t.backend.live_command_buffers(), 0);
}

// ============================================================================
// Render passes and draws
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_indirect_draws_are_chunked(#[case] backend: Backend) {
    let mut t =
        TestContext::with_config(backend, SyncConfig::default().with_max_indirect_draw_count(4));
    let target = t.color_target(16);
    let args = t.storage_buffer(1024);

    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("draw", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.barrier_indirect_draws(cmd, &[args]);
    list.begin_render_pass(
        cmd,
        color_pass(target, ImageLayout::Undefined, ImageLayout::ColorAttachment),
    );
    list.bind_graphics_pipeline(cmd, RawHandle::from_raw(5));
    list.draw_indexed_indirect(cmd, args, 0, 10, 16);
    list.end_render_pass(cmd);
    list.end_cmd(cmd).unwrap();

    let chunks: Vec<(u64, u32)> = t
        .log(cmd)
        .commands
        .iter()
        .filter_map(|c| match c {
            NativeCommand::DrawIndexedIndirect {
                offset,
                draw_count,
                stride,
                ..
            } => {
                assert_eq!(*stride, 16);
                Some((*offset, *draw_count))
            }
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![(0, 4), (64, 4), (128, 2)]);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_attachment_layout_fixed_before_pass(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let target = t.color_target(16);

    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("passes", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.begin_render_pass(
        cmd,
        color_pass(target, ImageLayout::Undefined, ImageLayout::ShaderReadOnly),
    );
    list.end_render_pass(cmd);
    assert!(barrier_groups(&t.log(cmd).commands).is_empty());

    let mut list = t.ctx.command_list();
    list.begin_render_pass(
        cmd,
        color_pass(target, ImageLayout::ColorAttachment, ImageLayout::ColorAttachment),
    );
    list.end_render_pass(cmd);
    list.end_cmd(cmd).unwrap();

    let log = t.log(cmd);
    assert_eq!(
        command_kinds(&log.commands),
        vec![
            "begin_render_pass",
            "end_render_pass",
            "barrier",
            "begin_render_pass",
            "end_render_pass",
        ]
    );
    let fix = barriers_for(&log.commands, target);
    assert_eq!(fix.len(), 1);
    assert_eq!(fix[0].old_layout, Some(ImageLayout::ShaderReadOnly));
    assert_eq!(fix[0].new_layout, Some(ImageLayout::ColorAttachment));
    assert_eq!(fix[0].src_stage, PipelineStages::COLOR_ATTACHMENT_OUTPUT);
    assert_eq!(
        t.ctx.tracker().current_layout(target),
        Some(ImageLayout::ColorAttachment)
    );
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_descriptor_bind_barriers_outside_pass(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let texture = t.texture(8, 1);
    let uniforms = t.storage_buffer(64);
    t.ctx.command_list().setup_initial_layout(texture).unwrap();
    let producer = submit_compute_write(&mut t, "w1", uniforms);

    let set = DescriptorSet::new(RawHandle::from_raw(2))
        .with_uniform_buffer(uniforms)
        .with_texture(texture);
    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("compute", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.bind_compute_pipeline(cmd, RawHandle::from_raw(3));
    list.bind_descriptor_sets(cmd, PipelineBindPoint::Compute, RawHandle::from_raw(4), 0, &[set]);
    list.dispatch(cmd, 8, 8, 1);
    list.end_cmd(cmd).unwrap();

    let log = t.log(cmd);
    assert_eq!(
        command_kinds(&log.commands),
        vec!["bind_pipeline", "barrier", "bind_descriptor_sets", "dispatch"]
    );
    let barriers = barriers_for(&log.commands, uniforms);
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].dst_access, AccessFlags::UNIFORM_READ);
    assert!(barriers_for(&log.commands, texture).is_empty());
    assert_eq!(t.ctx.tracker().cmd_dependencies(cmd)[0].cmd, producer);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_dispatch_rejected_inside_render_pass(#[case] backend: Backend) {
    let mut t = TestContext::new(backend);
    let target = t.color_target(16);

    let mut list = t.ctx.command_list();
    let cmd = list
        .start_cmd("pass", QueueFunction::Graphics, CommandBufferUsage::OneTime)
        .unwrap();
    list.begin_render_pass(
        cmd,
        color_pass(target, ImageLayout::Undefined, ImageLayout::ColorAttachment),
    );
    list.dispatch(cmd, 1, 1, 1);
    list.end_render_pass(cmd);
    list.draw_vertices(cmd, 3, 1, 0, 0);
    list.end_cmd(cmd).unwrap();

    assert_eq!(
        command_kinds(&t.log(cmd).commands),
        vec!["begin_render_pass", "end_render_pass"]
    );
}

// ============================================================================
// Resource lifetime
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_retired_resource_outlives_frames_in_flight(#[case] backend: Backend) {
    let mut t = TestContext::with_config(backend, SyncConfig::default().with_frames_in_flight(1));
    let buffer = t.storage_buffer(64);
    submit_compute_write(&mut t, "w1", buffer);
    t.ctx.command_list().flush_all_commands().unwrap();

    assert!(t.ctx.retire_resource(buffer));
    t.ctx.new_frame();
    assert!(t.ctx.resources().is_live(buffer));
    t.ctx.new_frame();
    assert!(!t.ctx.resources().is_live(buffer));
    assert!(t.ctx.tracker().record(buffer).is_none());
}
