// SPDX-License-Identifier: CEPL-1.0
//! Per-frame orchestration, independent of the device behind it.
//!
//! [`FrameLoop::run`] walks one frame through wait, acquire, write, record, reset,
//! submit and present against a [`FrameBackend`]. A stale swapchain at acquire or
//! present drops the frame, triggers recreation and restarts slot numbering at 0.
//! The in-flight fence is reset only right before the submit that re-signals it,
//! so an error while writing or recording never leaves a slot that waits forever.
use crate::error::FrameError;
use crate::mesh::MeshRegistry;
use crate::texture::TextureHandle;
use anyhow::Result;
use orrery_math::{CameraMatrices, CameraVectors, Mat4};
use std::collections::BTreeMap;

/// Everything copied into a frame slot's mapped buffers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameData {
    pub vectors: CameraVectors,
    pub matrices: CameraMatrices,
    /// Object transforms in draw order.
    pub transforms: Vec<Mat4>,
}

/// One instanced indexed draw covering every object of a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstancedDraw {
    pub texture: TextureHandle,
    pub first_index: u32,
    pub index_count: u32,
    pub instance_count: u32,
    pub first_instance: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrawPlan {
    pub draws: Vec<InstancedDraw>,
}

/// Orders the scene's transforms by mesh registration and emits one draw per populated type.
///
/// Types with no objects are skipped. A type registered with an empty mesh still
/// consumes its instance range but issues no draw.
pub fn plan_frame(
    registry: &MeshRegistry,
    objects: &BTreeMap<String, Vec<Mat4>>,
    capacity: usize,
) -> Result<(DrawPlan, Vec<Mat4>), FrameError> {
    if let Some(unknown) = objects.keys().find(|k| !registry.contains(k)) {
        return Err(FrameError::UnknownObjectType(unknown.clone()));
    }
    let count: usize = objects.values().map(Vec::len).sum();
    if count > capacity {
        return Err(FrameError::ObjectCapacity { count, capacity });
    }

    let mut plan = DrawPlan::default();
    let mut transforms = Vec::with_capacity(count);
    for (name, record) in registry.iter() {
        let Some(list) = objects.get(name).filter(|l| !l.is_empty()) else {
            continue;
        };
        if record.index_count > 0 {
            plan.draws.push(InstancedDraw {
                texture: record.texture,
                first_index: record.first_index,
                index_count: record.index_count,
                instance_count: list.len() as u32,
                first_instance: transforms.len() as u32,
            });
        }
        transforms.extend_from_slice(list);
    }
    Ok((plan, transforms))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// Out of date or no longer compatible with the display.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image_index: u32 },
    Dropped,
}

/// Device operations one frame needs. Slot-indexed calls use the frame slot, never the image index.
pub trait FrameBackend {
    fn slot_count(&self) -> usize;
    fn wait_in_flight(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn reset_in_flight(&mut self, slot: usize) -> Result<()>;
    fn write_frame(&mut self, slot: usize, frame: &FrameData) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32, plan: &DrawPlan) -> Result<()>;
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn recreate_swapchain(&mut self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameLoop {
    slot: usize,
}

impl FrameLoop {
    pub fn current_slot(&self) -> usize {
        self.slot
    }

    /// Restart at slot 0, as after any swapchain recreation.
    pub fn reset(&mut self) {
        self.slot = 0;
    }

    pub fn run<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        frame: &FrameData,
        plan: &DrawPlan,
    ) -> Result<FrameOutcome> {
        let slot = self.slot;
        backend.wait_in_flight(slot)?;

        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::Stale => return self.recreate(backend),
        };

        backend.write_frame(slot, frame)?;
        backend.record(slot, image_index, plan)?;
        backend.reset_in_flight(slot)?;
        backend.submit(slot)?;

        if backend.present(slot, image_index)? == PresentOutcome::Stale {
            return self.recreate(backend);
        }

        self.slot = (slot + 1) % backend.slot_count().max(1);
        Ok(FrameOutcome::Presented { slot, image_index })
    }

    fn recreate<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        backend.recreate_swapchain()?;
        self.reset();
        Ok(FrameOutcome::Dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshRecord;
    use orrery_math::Vec3;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Write(usize, usize),
        Record { slot: usize, image: u32, draws: usize },
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    struct MockBackend {
        slots: usize,
        next_image: u32,
        calls: Vec<Call>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        slots_after_recreate: usize,
        fail_record: bool,
    }

    impl MockBackend {
        fn new(slots: usize) -> Self {
            Self {
                slots,
                next_image: 0,
                calls: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                slots_after_recreate: slots,
                fail_record: false,
            }
        }

        fn recorded_draws(&self) -> usize {
            self.calls
                .iter()
                .map(|c| match c {
                    Call::Record { draws, .. } => *draws,
                    _ => 0,
                })
                .sum()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn slot_count(&self) -> usize {
            self.slots
        }
        fn wait_in_flight(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            Ok(())
        }
        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            Ok(self.acquire_script.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % self.slots as u32;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }))
        }
        fn reset_in_flight(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            Ok(())
        }
        fn write_frame(&mut self, slot: usize, frame: &FrameData) -> Result<()> {
            self.calls.push(Call::Write(slot, frame.transforms.len()));
            Ok(())
        }
        fn record(&mut self, slot: usize, image_index: u32, plan: &DrawPlan) -> Result<()> {
            self.calls.push(Call::Record {
                slot,
                image: image_index,
                draws: plan.draws.len(),
            });
            if self.fail_record {
                anyhow::bail!("command buffer recording failed");
            }
            Ok(())
        }
        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            Ok(())
        }
        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }
        fn recreate_swapchain(&mut self) -> Result<()> {
            self.calls.push(Call::Recreate);
            self.slots = self.slots_after_recreate;
            self.next_image = 0;
            Ok(())
        }
    }

    fn registry(types: &[(&str, u32)]) -> MeshRegistry {
        let mut reg = MeshRegistry::default();
        let mut first = 0;
        for (i, &(name, count)) in types.iter().enumerate() {
            reg.insert(
                name,
                MeshRecord {
                    first_index: first,
                    index_count: count,
                    texture: TextureHandle::new(i as u32),
                },
            );
            first += count;
        }
        reg
    }

    fn objects(types: &[(&str, usize)]) -> BTreeMap<String, Vec<Mat4>> {
        types
            .iter()
            .map(|&(name, n)| {
                let list = (0..n)
                    .map(|i| Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)))
                    .collect();
                (name.to_owned(), list)
            })
            .collect()
    }

    #[test]
    fn rock_and_tree_make_two_instanced_draws() {
        let reg = registry(&[("rock", 36), ("tree", 90)]);
        let (plan, transforms) =
            plan_frame(&reg, &objects(&[("rock", 3), ("tree", 5)]), 64).expect("plan");

        assert_eq!(plan.draws.len(), 2);
        assert_eq!(
            plan.draws.iter().map(|d| d.instance_count).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(
            plan.draws.iter().map(|d| d.first_instance).collect::<Vec<_>>(),
            vec![0, 3]
        );
        assert_eq!(plan.draws[1].first_index, 36);
        assert_eq!(transforms.len(), 8);
    }

    #[test]
    fn draw_order_follows_registration_not_name() {
        let reg = registry(&[("tree", 3), ("rock", 3)]);
        let (plan, transforms) =
            plan_frame(&reg, &objects(&[("rock", 1), ("tree", 2)]), 64).expect("plan");
        assert_eq!(plan.draws[0].texture, TextureHandle::new(0));
        assert_eq!(plan.draws[0].instance_count, 2);
        assert_eq!(plan.draws[1].first_instance, 2);
        assert_eq!(transforms[2], Mat4::IDENTITY);
    }

    #[test]
    fn types_without_objects_are_skipped() {
        let reg = registry(&[("rock", 3), ("bush", 6), ("tree", 3)]);
        let (plan, _) =
            plan_frame(&reg, &objects(&[("rock", 2), ("bush", 0), ("tree", 1)]), 64).expect("plan");
        assert_eq!(plan.draws.len(), 2);
        assert_eq!(plan.draws[1].first_instance, 2);
    }

    #[test]
    fn empty_mesh_advances_instances_without_drawing() {
        let reg = registry(&[("broken", 0), ("tree", 3)]);
        let (plan, transforms) =
            plan_frame(&reg, &objects(&[("broken", 2), ("tree", 1)]), 64).expect("plan");
        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].first_instance, 2);
        assert_eq!(transforms.len(), 3);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let reg = registry(&[("rock", 3)]);
        let err = plan_frame(&reg, &objects(&[("ghost", 1)]), 64).unwrap_err();
        assert_eq!(err, FrameError::UnknownObjectType("ghost".into()));
    }

    #[test]
    fn too_many_objects_is_an_error() {
        let reg = registry(&[("rock", 3)]);
        let err = plan_frame(&reg, &objects(&[("rock", 5)]), 4).unwrap_err();
        assert_eq!(
            err,
            FrameError::ObjectCapacity {
                count: 5,
                capacity: 4
            }
        );
    }

    #[test]
    fn slots_cycle_round_robin() {
        let mut backend = MockBackend::new(3);
        let mut frames = FrameLoop::default();
        let mut seen = Vec::new();
        for _ in 0..7 {
            match frames
                .run(&mut backend, &FrameData::default(), &DrawPlan::default())
                .expect("frame")
            {
                FrameOutcome::Presented { slot, .. } => seen.push(slot),
                FrameOutcome::Dropped => panic!("unexpected drop"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn frame_steps_run_in_order() {
        let mut backend = MockBackend::new(2);
        let mut frames = FrameLoop::default();
        let frame = FrameData {
            transforms: vec![Mat4::IDENTITY; 4],
            ..Default::default()
        };
        frames
            .run(&mut backend, &frame, &DrawPlan::default())
            .expect("frame");
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Write(0, 4),
                Call::Record {
                    slot: 0,
                    image: 0,
                    draws: 0
                },
                Call::Reset(0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
    }

    #[test]
    fn slot_and_image_index_are_tracked_separately() {
        let mut backend = MockBackend::new(3);
        backend.acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: false,
        });
        let mut frames = FrameLoop::default();
        let out = frames
            .run(&mut backend, &FrameData::default(), &DrawPlan::default())
            .expect("frame");
        assert_eq!(
            out,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 2
            }
        );
        assert!(backend.calls.contains(&Call::Present(0, 2)));
    }

    #[test]
    fn out_of_date_acquire_drops_the_frame() {
        let reg = registry(&[("rock", 3), ("tree", 3)]);
        let (plan, transforms) =
            plan_frame(&reg, &objects(&[("rock", 3), ("tree", 5)]), 64).expect("plan");
        let frame = FrameData {
            transforms,
            ..Default::default()
        };

        let mut backend = MockBackend::new(3);
        backend.acquire_script.push_back(AcquireOutcome::Stale);
        let mut frames = FrameLoop::default();
        let out = frames.run(&mut backend, &frame, &plan).expect("frame");

        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(backend.recorded_draws(), 0);
        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Reset(_))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::Submit(_))), 0);
    }

    #[test]
    fn stale_present_recreates_and_restarts_at_slot_zero() {
        let mut backend = MockBackend::new(3);
        let mut frames = FrameLoop::default();
        let (frame, plan) = (FrameData::default(), DrawPlan::default());
        frames.run(&mut backend, &frame, &plan).expect("frame 0");
        assert_eq!(frames.current_slot(), 1);

        backend.present_script.push_back(PresentOutcome::Stale);
        let out = frames.run(&mut backend, &frame, &plan).expect("frame 1");
        assert_eq!(out, FrameOutcome::Dropped);
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);
    }

    #[test]
    fn recreation_adopts_the_new_slot_count() {
        let mut backend = MockBackend::new(3);
        backend.slots_after_recreate = 2;
        backend.acquire_script.push_back(AcquireOutcome::Stale);
        let mut frames = FrameLoop::default();
        let (frame, plan) = (FrameData::default(), DrawPlan::default());
        assert_eq!(
            frames.run(&mut backend, &frame, &plan).expect("stale"),
            FrameOutcome::Dropped
        );

        let mut seen = Vec::new();
        for _ in 0..4 {
            if let FrameOutcome::Presented { slot, .. } =
                frames.run(&mut backend, &frame, &plan).expect("frame")
            {
                seen.push(slot);
            }
        }
        assert_eq!(seen, vec![0, 1, 0, 1]);
        assert!(backend.calls.iter().all(|c| match c {
            Call::Wait(s) | Call::Acquire(s) | Call::Reset(s) | Call::Submit(s) => *s < 3,
            _ => true,
        }));
    }

    #[test]
    fn recording_error_leaves_the_fence_signaled() {
        let mut backend = MockBackend::new(3);
        backend.fail_record = true;
        let mut frames = FrameLoop::default();
        let err = frames
            .run(&mut backend, &FrameData::default(), &DrawPlan::default())
            .unwrap_err();
        assert!(err.to_string().contains("recording failed"));
        assert_eq!(backend.count(|c| matches!(c, Call::Reset(_))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(frames.current_slot(), 0);
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let mut backend = MockBackend::new(2);
        backend.acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        });
        let mut frames = FrameLoop::default();
        let out = frames
            .run(&mut backend, &FrameData::default(), &DrawPlan::default())
            .expect("frame");
        assert!(matches!(out, FrameOutcome::Presented { image_index: 1, .. }));
    }
}
