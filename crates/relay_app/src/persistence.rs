use std::path::Path;

use relay_core::StoredCard;
use relay_engine::AtomicFileWriter;
use relay_logging::{relay_error, relay_info, relay_warn};
use serde::{Deserialize, Serialize};

pub const CARDS_FILENAME: &str = "overview_cards.ron";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedCards {
    cards: Vec<StoredCard>,
}

/// Cards saved by a previous run. Unreadable state is logged and treated as
/// empty; repair happens when the registry loads them.
pub fn load_cards(state_dir: &Path) -> Vec<StoredCard> {
    let writer = AtomicFileWriter::new(state_dir.to_path_buf());
    let content = match writer.read(CARDS_FILENAME) {
        Ok(Some(text)) => text,
        Ok(None) => return Vec::new(),
        Err(err) => {
            relay_warn!("failed to read cards from {:?}: {}", state_dir, err);
            return Vec::new();
        }
    };

    match ron::from_str::<PersistedCards>(&content) {
        Ok(state) => {
            relay_info!("loaded {} card(s) from {:?}", state.cards.len(), state_dir);
            state.cards
        }
        Err(err) => {
            relay_warn!("failed to parse cards in {:?}: {}", state_dir, err);
            Vec::new()
        }
    }
}

pub fn save_cards(state_dir: &Path, cards: &[StoredCard]) -> bool {
    let state = PersistedCards {
        cards: cards.to_vec(),
    };
    let content = match ron::ser::to_string_pretty(&state, ron::ser::PrettyConfig::new()) {
        Ok(text) => text,
        Err(err) => {
            relay_error!("failed to serialize cards: {}", err);
            return false;
        }
    };

    let writer = AtomicFileWriter::new(state_dir.to_path_buf());
    match writer.write(CARDS_FILENAME, &content) {
        Ok(path) => {
            relay_info!("saved {} card(s) to {:?}", cards.len(), path);
            true
        }
        Err(err) => {
            relay_error!("failed to write cards to {:?}: {}", state_dir, err);
            false
        }
    }
}
