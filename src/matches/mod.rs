//! Point matches between an image and the reference model, and their
//! conversion into solver input.
//!
//! A [`PointMatch`] pairs an optional image marker with an optional model
//! point. Only complete matches are handed to the solvers; incomplete ones
//! stay in the [`PointMatchList`] until they are filled in or removed.

use crate::camera::Resolution;
use crate::optimization::SolveError;
use crate::warning::Warning;
use log::warn;
use nalgebra::{Matrix2xX, Matrix3xX, Vector2, Vector3};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("no point match at index {index} (list has {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// One image/model correspondence.
///
/// `point_2d` is the marker position normalized to `[0, 1]` with the origin
/// at the bottom-left of the image. `point_3d` is in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointMatch {
    pub point_2d: Option<Vector2<f64>>,
    pub point_3d: Option<Vector3<f64>>,
}

impl PointMatch {
    pub fn new(point_2d: Vector2<f64>, point_3d: Vector3<f64>) -> Self {
        Self {
            point_2d: Some(point_2d),
            point_3d: Some(point_3d),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.point_2d.is_some() && self.point_3d.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.point_2d.is_none() && self.point_3d.is_none()
    }
}

/// Ordered point matches of one image.
///
/// The list never holds more than one empty match: clearing a slot or
/// removing a point prunes records that end up with neither point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointMatchList {
    matches: Vec<PointMatch>,
    active_index: usize,
}

impl PointMatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from existing matches, dropping empty ones.
    pub fn from_matches(matches: Vec<PointMatch>) -> Self {
        let mut list = Self {
            matches,
            active_index: 0,
        };
        list.prune();
        list
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PointMatch> {
        self.matches.iter()
    }

    pub fn as_slice(&self) -> &[PointMatch] {
        &self.matches
    }

    pub fn get(&self, index: usize) -> Option<&PointMatch> {
        self.matches.get(index)
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn set_active_index(&mut self, index: usize) -> Result<(), MatchError> {
        self.check_index(index)?;
        self.active_index = index;
        Ok(())
    }

    pub fn num_complete(&self) -> usize {
        self.matches.iter().filter(|m| m.is_complete()).count()
    }

    /// Appends an empty match unless one already exists. Returns the index
    /// of the empty match, which becomes active.
    pub fn push_empty(&mut self) -> usize {
        let index = match self.matches.iter().position(PointMatch::is_empty) {
            Some(index) => index,
            None => {
                self.matches.push(PointMatch::default());
                self.matches.len() - 1
            }
        };
        self.active_index = index;
        index
    }

    /// Puts a marker into the first match still missing one, or into a new
    /// match at the end. Returns its index, which becomes active.
    pub fn add_point_2d(&mut self, point: Vector2<f64>) -> usize {
        let index = self.first_or_new(|m| m.point_2d.is_none());
        self.matches[index].point_2d = Some(point);
        self.active_index = index;
        index
    }

    /// Model-point counterpart of [`PointMatchList::add_point_2d`].
    pub fn add_point_3d(&mut self, point: Vector3<f64>) -> usize {
        let index = self.first_or_new(|m| m.point_3d.is_none());
        self.matches[index].point_3d = Some(point);
        self.active_index = index;
        index
    }

    pub fn set_point_2d(&mut self, index: usize, point: Vector2<f64>) -> Result<(), MatchError> {
        self.check_index(index)?;
        self.matches[index].point_2d = Some(point);
        Ok(())
    }

    pub fn set_point_3d(&mut self, index: usize, point: Vector3<f64>) -> Result<(), MatchError> {
        self.check_index(index)?;
        self.matches[index].point_3d = Some(point);
        Ok(())
    }

    pub fn clear_point_2d(&mut self, index: usize) -> Result<(), MatchError> {
        self.check_index(index)?;
        self.matches[index].point_2d = None;
        self.prune();
        Ok(())
    }

    pub fn clear_point_3d(&mut self, index: usize) -> Result<(), MatchError> {
        self.check_index(index)?;
        self.matches[index].point_3d = None;
        self.prune();
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<PointMatch, MatchError> {
        self.check_index(index)?;
        let removed = self.matches.remove(index);
        self.clamp_active();
        Ok(removed)
    }

    fn first_or_new(&mut self, missing: impl Fn(&PointMatch) -> bool) -> usize {
        match self.matches.iter().position(missing) {
            Some(index) => index,
            None => {
                self.matches.push(PointMatch::default());
                self.matches.len() - 1
            }
        }
    }

    fn prune(&mut self) {
        self.matches.retain(|m| !m.is_empty());
        self.clamp_active();
    }

    fn clamp_active(&mut self) {
        self.active_index = self.active_index.min(self.matches.len().saturating_sub(1));
    }

    fn check_index(&self, index: usize) -> Result<(), MatchError> {
        if index < self.matches.len() {
            Ok(())
        } else {
            Err(MatchError::IndexOutOfRange {
                index,
                len: self.matches.len(),
            })
        }
    }
}

impl<'a> IntoIterator for &'a PointMatchList {
    type Item = &'a PointMatch;
    type IntoIter = std::slice::Iter<'a, PointMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.iter()
    }
}

/// Solver input built from the complete matches of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondences {
    /// Pixel coordinates, origin top-left.
    pub points_2d: Matrix2xX<f64>,
    pub points_3d: Matrix3xX<f64>,
    pub warning: Option<Warning>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.points_2d.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects the complete matches, in order, as pixel/world point arrays.
///
/// Markers are converted with `x = u * width` and `y = height - v * height`.
/// Skipped incomplete matches are reported through
/// [`Warning::IncompleteCorrespondences`].
///
/// # Errors
///
/// [`SolveError::NoCompleteCorrespondences`] if no match is complete.
pub fn extract_correspondences(
    matches: &[PointMatch],
    resolution: &Resolution,
) -> Result<Correspondences, SolveError> {
    let (width, height) = (resolution.width_f64(), resolution.height_f64());

    let complete: Vec<(Vector2<f64>, Vector3<f64>)> = matches
        .iter()
        .filter_map(|m| match (m.point_2d, m.point_3d) {
            (Some(p2), Some(p3)) => Some((Vector2::new(p2.x * width, height - p2.y * height), p3)),
            _ => None,
        })
        .collect();

    if complete.is_empty() {
        return Err(SolveError::NoCompleteCorrespondences);
    }

    let skipped = matches.len() - complete.len();
    let warning = (skipped > 0).then(|| {
        let warning = Warning::IncompleteCorrespondences { skipped };
        warn!("{warning}");
        warning
    });

    let points_2d = Matrix2xX::from_columns(&complete.iter().map(|(p, _)| *p).collect::<Vec<_>>());
    let points_3d = Matrix3xX::from_columns(&complete.iter().map(|(_, p)| *p).collect::<Vec<_>>());

    Ok(Correspondences {
        points_2d,
        points_3d,
        warning,
    })
}
