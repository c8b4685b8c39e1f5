//! Virtual display geometry and rotation rules.

use serde::{Deserialize, Serialize};

use crate::protocol::messages::DisplayCapabilitiesMessage;

/// Video encoders only accept dimensions aligned to this step.
pub const GEOMETRY_ALIGNMENT: u32 = 10;

/// Size and density of one virtual display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

impl DisplayGeometry {
    /// Builds the geometry for a client viewport.
    ///
    /// Width and height are rounded *down* to a multiple of
    /// [`GEOMETRY_ALIGNMENT`]; the density is kept as announced.
    ///
    /// ```rust
    /// use vdm_core::domain::display::DisplayGeometry;
    ///
    /// let g = DisplayGeometry::from_viewport(1085, 1919, 320);
    /// assert_eq!((g.width, g.height, g.density_dpi), (1080, 1910, 320));
    /// ```
    pub fn from_viewport(width: u32, height: u32, density_dpi: u32) -> Self {
        Self {
            width: align_down(width),
            height: align_down(height),
            density_dpi,
        }
    }

    pub fn from_capabilities(caps: &DisplayCapabilitiesMessage) -> Self {
        Self::from_viewport(caps.viewport_width, caps.viewport_height, caps.density_dpi)
    }

    /// A viewport smaller than one alignment step cannot back a display.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

fn align_down(value: u32) -> u32 {
    value / GEOMETRY_ALIGNMENT * GEOMETRY_ALIGNMENT
}

/// What a host virtual display shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayType {
    /// A single app launched onto the display.
    #[default]
    App,
    /// A full home-screen experience.
    Home,
    /// A mirror of the host's default display.
    Mirror,
}

impl DisplayType {
    /// Whether the display accepts a home event for itself.
    pub fn supports_home(&self) -> bool {
        matches!(self, DisplayType::Home | DisplayType::Mirror)
    }
}

/// Rotation of a host virtual display, in quarter turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl Rotation {
    /// Degrees the *client* must rotate its view by to undo this rotation.
    ///
    /// The host rotating clockwise means the client rotates the other way:
    /// 90 → -90, 180 → 180, 270 → 90, anything else → 0.
    pub fn to_client_degrees(self) -> i32 {
        match self {
            Rotation::Rotation90 => -90,
            Rotation::Rotation180 => 180,
            Rotation::Rotation270 => 90,
            Rotation::Rotation0 => 0,
        }
    }

    /// Parses a host rotation expressed in degrees; unknown values map to 0.
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Rotation90,
            180 => Rotation::Rotation180,
            270 => Rotation::Rotation270,
            _ => Rotation::Rotation0,
        }
    }
}

/// Remembers the last rotation reported to the client so that repeated
/// display-changed notifications with the same rotation are not re-sent.
#[derive(Debug, Default)]
pub struct RotationTracker {
    last_sent: Option<Rotation>,
}

impl RotationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a rotation that is already known to the client.
    pub fn with_initial(rotation: Rotation) -> Self {
        Self {
            last_sent: Some(rotation),
        }
    }

    /// Returns the client degrees to send if `current` differs from the last
    /// rotation sent, recording it as sent.
    pub fn update(&mut self, current: Rotation) -> Option<i32> {
        if self.last_sent == Some(current) {
            return None;
        }
        self.last_sent = Some(current);
        Some(current.to_client_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rounds_width_and_height_down_to_ten() {
        // Arrange
        let caps = DisplayCapabilitiesMessage {
            display_id: 1,
            viewport_width: 1279,
            viewport_height: 805,
            density_dpi: 213,
        };

        // Act
        let geometry = DisplayGeometry::from_capabilities(&caps);

        // Assert
        assert_eq!(geometry.width, 1270);
        assert_eq!(geometry.height, 800);
        assert_eq!(geometry.density_dpi, 213, "density is not rounded");
    }

    #[test]
    fn test_geometry_keeps_aligned_values() {
        let geometry = DisplayGeometry::from_viewport(640, 480, 160);
        assert_eq!(geometry, DisplayGeometry { width: 640, height: 480, density_dpi: 160 });
        assert!(!geometry.is_empty());
    }

    #[test]
    fn test_geometry_below_one_step_is_empty() {
        assert!(DisplayGeometry::from_viewport(9, 480, 160).is_empty());
    }

    #[test]
    fn test_rotation_maps_to_opposite_client_degrees() {
        assert_eq!(Rotation::Rotation0.to_client_degrees(), 0);
        assert_eq!(Rotation::Rotation90.to_client_degrees(), -90);
        assert_eq!(Rotation::Rotation180.to_client_degrees(), 180);
        assert_eq!(Rotation::Rotation270.to_client_degrees(), 90);
    }

    #[test]
    fn test_rotation_from_degrees_normalises_and_defaults_to_zero() {
        assert_eq!(Rotation::from_degrees(-90), Rotation::Rotation270);
        assert_eq!(Rotation::from_degrees(450), Rotation::Rotation90);
        assert_eq!(Rotation::from_degrees(45), Rotation::Rotation0);
    }

    #[test]
    fn test_rotation_tracker_suppresses_repeated_rotation() {
        // Arrange
        let mut tracker = RotationTracker::with_initial(Rotation::Rotation0);

        // Act
        let first = tracker.update(Rotation::Rotation90);
        let repeat = tracker.update(Rotation::Rotation90);
        let changed = tracker.update(Rotation::Rotation180);

        // Assert
        assert_eq!(first, Some(-90));
        assert_eq!(repeat, None);
        assert_eq!(changed, Some(180));
    }

    #[test]
    fn test_rotation_tracker_without_initial_reports_first_value() {
        let mut tracker = RotationTracker::new();
        assert_eq!(tracker.update(Rotation::Rotation0), Some(0));
        assert_eq!(tracker.update(Rotation::Rotation0), None);
    }

    #[test]
    fn test_only_home_and_mirror_displays_support_home() {
        assert!(!DisplayType::App.supports_home());
        assert!(DisplayType::Home.supports_home());
        assert!(DisplayType::Mirror.supports_home());
    }
}
