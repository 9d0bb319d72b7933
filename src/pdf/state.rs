//! Host-side view state
//!
//! Hosts push property changes in as [`Command`]s and act on the returned
//! [`Effect`]s. A render is requested only when the derived image key
//! changes, so re-applying equivalent values (page 2.3 after page 2.9, say)
//! costs nothing.

use super::color::BackgroundKey;
use super::keys::PageIndex;
use super::request::RenderRequest;
use super::zoom::ZoomLevel;

/// Current reactive property values for one view
#[derive(Clone, Debug)]
pub struct ViewState {
    /// Logical source identifier, if one is bound
    pub source: Option<String>,

    /// Page number as the host drives it (may be fractional)
    pub page_number: f64,

    /// Display scale per axis
    pub scale_x: f64,
    pub scale_y: f64,

    /// Background color in any supported notation
    pub background: String,

    /// Asset generation hash
    pub freshness: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct DerivedKey {
    source: String,
    freshness: Option<String>,
    page: PageIndex,
    zoom: ZoomLevel,
    background: BackgroundKey,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: None,
            page_number: 1.0,
            scale_x: 1.0,
            scale_y: 1.0,
            background: "white".to_string(),
            freshness: None,
        }
    }

    /// Apply a command and return resulting effects
    #[must_use]
    pub fn apply(&mut self, cmd: Command) -> Vec<Effect> {
        let before = self.derived_key();

        match cmd {
            Command::Reload => {
                return match (self.source.clone(), self.request()) {
                    (Some(source), Some(request)) => {
                        vec![Effect::Invalidate(source), Effect::RequestImage(request)]
                    }
                    _ => vec![],
                };
            }

            Command::SetSource(source) => self.source = Some(source),
            Command::ClearSource => self.source = None,
            Command::SetPageNumber(page_number) => self.page_number = page_number,
            Command::SetScale { x, y } => {
                self.scale_x = x;
                self.scale_y = y;
            }
            Command::SetBackground(background) => self.background = background,
            Command::SetFreshness(token) => self.freshness = token,
        }

        let after = self.derived_key();
        if before == after {
            return vec![];
        }

        let Some(after) = after else {
            return vec![Effect::Clear];
        };

        let mut effects = Vec::new();
        let document_changed = before
            .as_ref()
            .is_none_or(|b| b.source != after.source || b.freshness != after.freshness);
        if document_changed {
            effects.push(Effect::RefreshPageCount);
        }
        if let Some(request) = self.request() {
            effects.push(Effect::RequestImage(request));
        }
        effects
    }

    /// Zoom derived from the per-axis scale
    #[must_use]
    pub fn zoom(&self) -> ZoomLevel {
        ZoomLevel::from_axes(self.scale_x, self.scale_y)
    }

    /// Request for the current values, if a source is bound
    #[must_use]
    pub fn request(&self) -> Option<RenderRequest> {
        let source = self.source.as_ref()?;
        let mut request = RenderRequest::new(source.clone())
            .page(self.page_number)
            .zoom(self.zoom().factor())
            .background(self.background.clone());
        request.freshness = self.freshness.clone();
        Some(request)
    }

    fn derived_key(&self) -> Option<DerivedKey> {
        Some(DerivedKey {
            source: self.source.clone()?,
            freshness: self.freshness.clone(),
            page: PageIndex::floor(self.page_number),
            zoom: self.zoom(),
            background: BackgroundKey::normalize(&self.background),
        })
    }
}

/// Property changes pushed by the host
#[derive(Clone, Debug)]
pub enum Command {
    /// Bind a logical source
    SetSource(String),
    /// Unbind the source
    ClearSource,
    /// Page number as driven by the host
    SetPageNumber(f64),
    /// Display scale per axis
    SetScale { x: f64, y: f64 },
    /// Background color
    SetBackground(String),
    /// Asset generation hash
    SetFreshness(Option<String>),
    /// The bound asset changed on disk
    Reload,
}

/// Effects produced by state changes
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Ask the pipeline for the image of the current values
    RequestImage(RenderRequest),
    /// Re-read the document page count
    RefreshPageCount,
    /// Evict everything cached for a logical source
    Invalidate(String),
    /// Nothing to show any more
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_state() -> ViewState {
        let mut state = ViewState::new();
        let _ = state.apply(Command::SetSource("deck.pdf".to_string()));
        state
    }

    fn requested(effects: &[Effect]) -> Option<&RenderRequest> {
        effects.iter().find_map(|effect| match effect {
            Effect::RequestImage(request) => Some(request),
            _ => None,
        })
    }

    #[test]
    fn binding_source_requests_image_and_page_count() {
        let mut state = ViewState::new();
        let effects = state.apply(Command::SetSource("deck.pdf".to_string()));

        assert_eq!(effects[0], Effect::RefreshPageCount);
        assert_eq!(requested(&effects).unwrap().source, "deck.pdf");
    }

    #[test]
    fn unbound_state_has_no_effects() {
        let mut state = ViewState::new();
        assert!(state.apply(Command::SetPageNumber(3.0)).is_empty());
        assert!(state.apply(Command::Reload).is_empty());
    }

    #[test]
    fn same_floored_page_returns_empty() {
        let mut state = bound_state();
        let effects = state.apply(Command::SetPageNumber(1.7));
        assert!(effects.is_empty());
    }

    #[test]
    fn page_change_requests_image_only() {
        let mut state = bound_state();
        let effects = state.apply(Command::SetPageNumber(2.9));

        assert_eq!(effects.len(), 1);
        assert_eq!(requested(&effects).unwrap().page_number, 2.9);
    }

    #[test]
    fn scale_uses_larger_axis() {
        let mut state = bound_state();
        let effects = state.apply(Command::SetScale { x: 1.5, y: 2.0 });
        assert_eq!(requested(&effects).unwrap().zoom, 2.0);

        // Same max axis, different minor axis: same key.
        assert!(state.apply(Command::SetScale { x: 1.0, y: 2.0 }).is_empty());
    }

    #[test]
    fn equivalent_background_returns_empty() {
        let mut state = bound_state();
        assert!(state.apply(Command::SetBackground("#fff".to_string())).is_empty());
        assert!(state.apply(Command::SetBackground("bogus".to_string())).is_empty());
        assert_eq!(
            state.apply(Command::SetBackground("black".to_string())).len(),
            1
        );
    }

    #[test]
    fn freshness_change_refreshes_page_count() {
        let mut state = bound_state();
        let effects = state.apply(Command::SetFreshness(Some("h2".to_string())));
        assert_eq!(effects[0], Effect::RefreshPageCount);
        assert_eq!(
            requested(&effects).unwrap().freshness.as_deref(),
            Some("h2")
        );
    }

    #[test]
    fn reload_invalidates_and_requests() {
        let mut state = bound_state();
        let effects = state.apply(Command::Reload);

        assert_eq!(effects[0], Effect::Invalidate("deck.pdf".to_string()));
        assert!(requested(&effects).is_some());
    }

    #[test]
    fn clearing_source_clears_view() {
        let mut state = bound_state();
        assert_eq!(state.apply(Command::ClearSource), vec![Effect::Clear]);
    }
}
