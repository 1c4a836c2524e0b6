//! Light descriptors, the per-frame light collection and the default batching policy.
//!
//! # Batch policy
//!
//! A program declares a fixed number of light slots (`LightColor[i]`, `LightPosition[i]`,
//! `LightAttenuation[i]`). [`batched_light_update`] fills as many slots as the program has, in
//! collection order, once per call. The collection keeps every directional light ahead of the
//! point lights, so directional lights land in the earliest batches. With `N` lights and `B`
//! slots a drawcall therefore takes `ceil(N / B)` batches.
//!
//! Per batch the policy also uploads `LightCount` (lights in this batch) and `LightBatch`
//! (batch number, starting at 0). Programs use `LightBatch == 0` to add ambient light only once.

use glam::{Vec2, Vec3, Vec4};

use crate::renderer::LightUpdateFn;
use crate::shader::{ShaderProgram, UniformLocation};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    /// Parallel light travelling along `direction`.
    Directional { direction: Vec3 },
    /// Light at `position`, fading out between `attenuation.x` and `attenuation.y` units away.
    Point { position: Vec3, attenuation: Vec2 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightDescriptor {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
}

impl LightDescriptor {
    pub fn directional(direction: Vec3) -> Self {
        Self {
            kind: LightKind::Directional {
                direction: direction.normalize_or(Vec3::NEG_Y),
            },
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }

    pub fn point(position: Vec3) -> Self {
        Self {
            kind: LightKind::Point {
                position,
                attenuation: Vec2::new(0.0, 10.0),
            },
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    /// Sets the fade range of a point light. No effect on directional lights.
    pub fn with_attenuation(mut self, start: f32, end: f32) -> Self {
        if let LightKind::Point { attenuation, .. } = &mut self.kind {
            *attenuation = Vec2::new(start, end);
        }
        self
    }

    pub fn is_directional(&self) -> bool {
        matches!(self.kind, LightKind::Directional { .. })
    }

    /// Colour scaled by intensity.
    pub fn radiance(&self) -> Vec3 {
        self.color * self.intensity
    }

    /// `(direction, 0)` for directional lights, `(position, 1)` for point lights.
    pub fn position_uniform(&self) -> Vec4 {
        match self.kind {
            LightKind::Directional { direction } => direction.extend(0.0),
            LightKind::Point { position, .. } => position.extend(1.0),
        }
    }

    pub fn attenuation_uniform(&self) -> Vec4 {
        match self.kind {
            LightKind::Directional { .. } => Vec4::ZERO,
            LightKind::Point { attenuation, .. } => attenuation.extend(0.0).extend(0.0),
        }
    }
}

/// Lights gathered for the current frame.
#[derive(Clone, Debug, Default)]
pub struct LightCollection {
    lights: Vec<LightDescriptor>,
    directional: usize,
}

impl LightCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a light. Directional lights are kept ahead of point lights; insertion order is
    /// preserved within each kind.
    pub fn push(&mut self, light: LightDescriptor) {
        if light.is_directional() {
            self.lights.insert(self.directional, light);
            self.directional += 1;
        } else {
            self.lights.push(light);
        }
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn directional_count(&self) -> usize {
        self.directional
    }

    pub fn get(&self, index: usize) -> Option<&LightDescriptor> {
        self.lights.get(index)
    }

    pub fn as_slice(&self) -> &[LightDescriptor] {
        &self.lights
    }

    pub fn iter(&self) -> impl Iterator<Item = &LightDescriptor> {
        self.lights.iter()
    }

    pub fn clear(&mut self) {
        self.lights.clear();
        self.directional = 0;
    }
}

struct LightSlot {
    color: UniformLocation,
    position: Option<UniformLocation>,
    attenuation: Option<UniformLocation>,
}

/// Builds the default light-update callback for `program`.
///
/// Slots are discovered from consecutive `LightColor[i]` uniforms; a program without any
/// gets a callback that never binds a light.
pub fn batched_light_update(program: &ShaderProgram) -> LightUpdateFn {
    let count = program.uniform_location("LightCount");
    let batch = program.uniform_location("LightBatch");
    let slots: Vec<LightSlot> = (0..)
        .map_while(|i| {
            Some(LightSlot {
                color: program.uniform_location(&format!("LightColor[{i}]"))?,
                position: program.uniform_location(&format!("LightPosition[{i}]")),
                attenuation: program.uniform_location(&format!("LightAttenuation[{i}]")),
            })
        })
        .collect();
    log::debug!(
        "program `{}`: {} light slots per batch",
        program.name(),
        slots.len()
    );

    Box::new(move |program, lights, index| {
        let start = *index;
        let end = (start + slots.len()).min(lights.len());
        if end <= start {
            if let Some(count) = count {
                program.set_uniform(count, 0);
            }
            if let Some(batch) = batch {
                program.set_uniform(batch, 0);
            }
            return false;
        }

        for (slot, light) in slots.iter().zip(&lights.as_slice()[start..end]) {
            program.set_uniform(slot.color, light.radiance());
            if let Some(position) = slot.position {
                program.set_uniform(position, light.position_uniform());
            }
            if let Some(attenuation) = slot.attenuation {
                program.set_uniform(attenuation, light.attenuation_uniform());
            }
        }
        if let Some(count) = count {
            program.set_uniform(count, (end - start) as i32);
        }
        if let Some(batch) = batch {
            program.set_uniform(batch, (start / slots.len()) as i32);
        }
        *index = end;
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{UniformKind, VertexOutput};

    fn program(slots: usize) -> ShaderProgram {
        ShaderProgram::builder("lights")
            .uniform("LightCount", UniformKind::Int)
            .uniform("LightBatch", UniformKind::Int)
            .uniform_array("LightColor", UniformKind::Vec3, slots)
            .uniform_array("LightPosition", UniformKind::Vec4, slots)
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|_, _| None)
            .build()
            .unwrap()
    }

    fn collection(directional: usize, point: usize) -> LightCollection {
        let mut lights = LightCollection::new();
        for i in 0..point {
            lights.push(LightDescriptor::point(Vec3::X * i as f32));
        }
        for _ in 0..directional {
            lights.push(LightDescriptor::directional(Vec3::NEG_Y));
        }
        lights
    }

    #[test]
    fn directional_lights_come_first() {
        let mut lights = LightCollection::new();
        lights.push(LightDescriptor::point(Vec3::X));
        lights.push(LightDescriptor::directional(Vec3::NEG_Y));
        lights.push(LightDescriptor::point(Vec3::Y));
        lights.push(LightDescriptor::directional(Vec3::NEG_X));

        let kinds: Vec<bool> = lights.iter().map(LightDescriptor::is_directional).collect();
        assert_eq!(kinds, [true, true, false, false]);
        assert_eq!(lights.get(1).unwrap().position_uniform(), Vec4::new(-1.0, 0.0, 0.0, 0.0));
        assert_eq!(lights.get(2).unwrap().position_uniform(), Vec4::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn batches_consume_all_slots() {
        let program = program(2);
        let update = batched_light_update(&program);
        let lights = collection(1, 4);
        let mut index = 0;
        let mut batches = 0;
        while update(&program, &lights, &mut index) {
            batches += 1;
        }
        assert_eq!(batches, 3);
        assert_eq!(index, 5);
        assert_eq!(program.get_uniform::<i32>("LightCount"), Ok(0));
    }

    #[test]
    fn last_batch_reports_partial_count() {
        let program = program(2);
        let update = batched_light_update(&program);
        let lights = collection(0, 3);
        let mut index = 0;
        assert!(update(&program, &lights, &mut index));
        assert_eq!(program.get_uniform::<i32>("LightCount"), Ok(2));
        assert!(update(&program, &lights, &mut index));
        assert_eq!(program.get_uniform::<i32>("LightCount"), Ok(1));
        assert_eq!(program.get_uniform::<i32>("LightBatch"), Ok(1));
        assert_eq!(
            program.get_uniform::<Vec4>("LightPosition[0]"),
            Ok(Vec4::new(2.0, 0.0, 0.0, 1.0))
        );
    }

    #[test]
    fn programs_without_slots_never_bind() {
        let program = program(0);
        let update = batched_light_update(&program);
        let mut index = 0;
        assert!(!update(&program, &collection(2, 0), &mut index));
        assert_eq!(index, 0);
    }

    #[test]
    fn radiance_and_attenuation() {
        let light = LightDescriptor::point(Vec3::ZERO)
            .with_color(Vec3::new(1.0, 0.5, 0.0))
            .with_intensity(2.0)
            .with_attenuation(1.0, 4.0);
        assert_eq!(light.radiance(), Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(light.attenuation_uniform(), Vec4::new(1.0, 4.0, 0.0, 0.0));
    }
}
