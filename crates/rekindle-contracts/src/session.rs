use std::collections::BTreeSet;

use crate::history::ConversationLedger;
use crate::images::GeneratedImage;
use crate::photos::{Photo, PhotoRole};

/// Action classes that own an authoritative request token. A completed call is
/// committed only if its token is still current for the slot; a superseded
/// result is discarded instead of clobbering newer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionSlot {
    Generation,
    Edit,
    Enhancement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken {
    pub slot: ActionSlot,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TokenCounters {
    generation: u64,
    edit: u64,
    enhancement: u64,
}

impl TokenCounters {
    fn slot_mut(&mut self, slot: ActionSlot) -> &mut u64 {
        match slot {
            ActionSlot::Generation => &mut self.generation,
            ActionSlot::Edit => &mut self.edit,
            ActionSlot::Enhancement => &mut self.enhancement,
        }
    }

    fn slot(&self, slot: ActionSlot) -> u64 {
        match slot {
            ActionSlot::Generation => self.generation,
            ActionSlot::Edit => self.edit,
            ActionSlot::Enhancement => self.enhancement,
        }
    }
}

/// All mutable state of one logical session: the photo set, the generated
/// image list, the conversation ledger and the per-action request tokens.
/// Mutation happens only through these entry points.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    photos: Vec<Photo>,
    images: Vec<GeneratedImage>,
    superseded: BTreeSet<String>,
    ledger: ConversationLedger,
    tokens: TokenCounters,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_photo(&mut self, photo: Photo) -> &Photo {
        self.photos.push(photo);
        self.photos.last().expect("photo just pushed")
    }

    pub fn photos(&self) -> &[Photo] {
        &self.photos
    }

    pub fn photo(&self, id: &str) -> Option<&Photo> {
        self.photos.iter().find(|photo| photo.id == id)
    }

    pub fn photos_with_role(&self, role: PhotoRole) -> Vec<&Photo> {
        self.photos.iter().filter(|photo| photo.role == role).collect()
    }

    /// Manual role override; clears `auto_detected` so the heuristic result is
    /// no longer implied.
    pub fn cycle_photo_role(&mut self, id: &str) -> Option<PhotoRole> {
        let photo = self.photos.iter_mut().find(|photo| photo.id == id)?;
        photo.role = photo.role.cycle();
        photo.auto_detected = false;
        Some(photo.role)
    }

    pub fn remove_photo(&mut self, id: &str) -> bool {
        let before = self.photos.len();
        self.photos.retain(|photo| photo.id != id);
        self.photos.len() != before
    }

    pub fn replace_photo_bytes(&mut self, id: &str, bytes: Vec<u8>, mime_type: String, enhanced: bool) -> bool {
        if let Some(photo) = self.photos.iter_mut().find(|photo| photo.id == id) {
            photo.bytes = bytes;
            photo.mime_type = mime_type;
            photo.enhanced = enhanced;
            true
        } else {
            false
        }
    }

    pub fn clear_photos(&mut self) {
        self.photos.clear();
    }

    /// Newest first, matching the display order.
    pub fn record_image(&mut self, image: GeneratedImage) -> &GeneratedImage {
        self.images.insert(0, image);
        self.images.first().expect("image just inserted")
    }

    /// Appends the replacement and hides the prior record from the current
    /// view. The prior record stays in `all_images` for auditability.
    pub fn supersede_image(&mut self, prior_id: &str, replacement: GeneratedImage) -> &GeneratedImage {
        self.superseded.insert(prior_id.to_string());
        self.record_image(replacement)
    }

    pub fn current_images(&self) -> Vec<&GeneratedImage> {
        self.images
            .iter()
            .filter(|image| !self.superseded.contains(&image.id))
            .collect()
    }

    pub fn all_images(&self) -> &[GeneratedImage] {
        &self.images
    }

    pub fn image(&self, id: &str) -> Option<&GeneratedImage> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn latest_image(&self) -> Option<&GeneratedImage> {
        self.current_images().into_iter().next()
    }

    pub fn ledger(&self) -> &ConversationLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut ConversationLedger {
        &mut self.ledger
    }

    pub fn begin(&mut self, slot: ActionSlot) -> RequestToken {
        let counter = self.tokens.slot_mut(slot);
        *counter += 1;
        RequestToken {
            slot,
            value: *counter,
        }
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.tokens.slot(token.slot) == token.value
    }
}
