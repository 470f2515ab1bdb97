//! Plane and framebuffer discovery
//!
//! Finds the scan-out plane to capture and, optionally, the hardware cursor
//! plane on the same CRTC.

use super::{CaptureError, Result};
use crate::drm::{DisplayPlane, PlaneEnumerator, PlaneType};
use log::{debug, info, warn};

/// Primary (captured) plane plus the cursor plane, if one was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedPlanes {
    pub primary: DisplayPlane,
    pub cursor: Option<DisplayPlane>,
}

/// Plane selection parameters. Zero means "not requested".
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLocator {
    pub requested_plane: u32,
    pub requested_crtc: u32,
    pub want_cursor: bool,
}

impl PlaneLocator {
    pub fn new(requested_plane: u32, requested_crtc: u32, want_cursor: bool) -> Self {
        Self { requested_plane, requested_crtc, want_cursor }
    }

    /// Enumerate planes and pick the primary and cursor planes.
    ///
    /// On the `first_time` enumeration every plane is logged and a missing
    /// cursor is reported; later calls stay quiet.
    pub fn locate(&self, planes: &dyn PlaneEnumerator, first_time: bool) -> Result<LocatedPlanes> {
        let ids = planes.plane_ids()?;
        if first_time {
            info!("{} planes on device", ids.len());
        }

        let mut primary = None;
        if self.requested_plane != 0 {
            let plane = planes.plane(self.requested_plane)?;
            if plane.fb_id == 0 {
                return Err(CaptureError::NoFramebuffer(plane.plane_id));
            }
            primary = Some(plane);
        }

        let mut cursor = None;
        for id in ids {
            let plane = match planes.plane(id) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if first_time {
                info!(
                    "Plane {} CRTC {} FB {} Type {}",
                    plane.plane_id, plane.crtc_id, plane.fb_id, plane.plane_type
                );
            }
            if plane.fb_id == 0 {
                continue;
            }

            match primary {
                None => {
                    if self.requested_crtc == 0 || plane.crtc_id == self.requested_crtc {
                        primary = Some(plane);
                    }
                }
                Some(p) => {
                    if self.want_cursor
                        && cursor.is_none()
                        && plane.plane_type == PlaneType::Cursor
                        && plane.crtc_id == p.crtc_id
                    {
                        cursor = Some(plane);
                    }
                }
            }
            if primary.is_some() && (cursor.is_some() || !self.want_cursor) && !first_time {
                break;
            }
        }

        let primary = primary.ok_or(CaptureError::NoPlane)?;
        if self.want_cursor && cursor.is_none() && first_time {
            warn!("No cursor plane found on CRTC {}, cursor capture disabled", primary.crtc_id);
        }
        if let Some(c) = cursor {
            debug!("Cursor plane {} on CRTC {}", c.plane_id, c.crtc_id);
        }
        Ok(LocatedPlanes { primary, cursor })
    }

    /// Re-read the cursor plane by id, or search again when none is known.
    /// Returns `None` when no cursor plane is currently attached.
    pub fn refresh_cursor(
        &self,
        planes: &dyn PlaneEnumerator,
        known: Option<DisplayPlane>,
    ) -> Option<DisplayPlane> {
        if !self.want_cursor {
            return None;
        }
        match known {
            Some(cursor) => match planes.plane(cursor.plane_id) {
                Ok(plane) => Some(plane),
                Err(e) => {
                    debug!("Cursor plane {} refresh failed: {}", cursor.plane_id, e);
                    None
                }
            },
            None => self.locate(planes, false).ok().and_then(|found| found.cursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::{DrmError, Result as DrmResult};
    use std::io;

    /// In-memory plane table
    struct FakePlanes(Vec<DisplayPlane>);

    impl PlaneEnumerator for FakePlanes {
        fn plane_ids(&self) -> DrmResult<Vec<u32>> {
            Ok(self.0.iter().map(|p| p.plane_id).collect())
        }

        fn plane(&self, plane_id: u32) -> DrmResult<DisplayPlane> {
            self.0
                .iter()
                .find(|p| p.plane_id == plane_id)
                .copied()
                .ok_or_else(|| DrmError::Plane(plane_id, io::Error::from_raw_os_error(libc::ENOENT)))
        }
    }

    fn plane(plane_id: u32, crtc_id: u32, fb_id: u32, plane_type: PlaneType) -> DisplayPlane {
        DisplayPlane { plane_id, crtc_id, fb_id, plane_type }
    }

    fn two_heads() -> FakePlanes {
        FakePlanes(vec![
            plane(31, 0, 0, PlaneType::Overlay),
            plane(32, 51, 90, PlaneType::Primary),
            plane(33, 51, 91, PlaneType::Cursor),
            plane(40, 52, 95, PlaneType::Primary),
            plane(41, 52, 96, PlaneType::Cursor),
        ])
    }

    #[test]
    fn test_first_plane_with_framebuffer() {
        let found = PlaneLocator::new(0, 0, false).locate(&two_heads(), true).unwrap();
        assert_eq!(found.primary.plane_id, 32);
        assert_eq!(found.cursor, None);
    }

    #[test]
    fn test_crtc_filter_and_cursor() {
        let found = PlaneLocator::new(0, 52, true).locate(&two_heads(), true).unwrap();
        assert_eq!(found.primary.plane_id, 40);
        assert_eq!(found.cursor.map(|c| c.plane_id), Some(41));
    }

    #[test]
    fn test_cursor_must_share_crtc() {
        let planes = FakePlanes(vec![
            plane(32, 51, 90, PlaneType::Primary),
            plane(41, 52, 96, PlaneType::Cursor),
        ]);
        let found = PlaneLocator::new(0, 0, true).locate(&planes, true).unwrap();
        assert_eq!(found.primary.plane_id, 32);
        assert_eq!(found.cursor, None);
    }

    #[test]
    fn test_explicit_plane() {
        let found = PlaneLocator::new(40, 51, true).locate(&two_heads(), false).unwrap();
        assert_eq!(found.primary.plane_id, 40);
        assert_eq!(found.cursor.map(|c| c.plane_id), Some(41));
    }

    #[test]
    fn test_explicit_plane_without_framebuffer_is_fatal() {
        let err = PlaneLocator::new(31, 0, false).locate(&two_heads(), true).unwrap_err();
        assert!(matches!(err, CaptureError::NoFramebuffer(31)));
    }

    #[test]
    fn test_explicit_plane_missing_is_fatal() {
        let err = PlaneLocator::new(99, 0, false).locate(&two_heads(), true).unwrap_err();
        assert!(matches!(err, CaptureError::Drm(DrmError::Plane(99, _))));
    }

    #[test]
    fn test_no_plane_is_fatal() {
        let planes = FakePlanes(vec![plane(31, 0, 0, PlaneType::Overlay)]);
        let err = PlaneLocator::new(0, 0, false).locate(&planes, true).unwrap_err();
        assert!(matches!(err, CaptureError::NoPlane));
        let err = PlaneLocator::new(0, 77, false).locate(&two_heads(), true).unwrap_err();
        assert!(matches!(err, CaptureError::NoPlane));
    }

    #[test]
    fn test_refresh_cursor() {
        let locator = PlaneLocator::new(0, 0, true);
        let planes = two_heads();
        let known = Some(plane(33, 51, 0, PlaneType::Cursor));
        assert_eq!(locator.refresh_cursor(&planes, known).map(|c| c.fb_id), Some(91));
        assert_eq!(locator.refresh_cursor(&planes, None).map(|c| c.plane_id), Some(33));
        assert_eq!(PlaneLocator::new(0, 0, false).refresh_cursor(&planes, known), None);
    }
}
