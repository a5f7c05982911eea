//! Static gift-card catalog.
//!
//! Card metadata is loaded once at startup from configuration and never
//! mutated. Sold-out state lives in the order store, not here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable metadata for one single-unit gift card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftCard {
    /// Catalog identifier.
    pub id: u32,
    /// Brand displayed to the buyer.
    pub brand: String,
    /// Face value in whole rupees.
    pub value_inr: i64,
    /// Discounted amount the buyer actually pays, in whole rupees.
    pub payable_inr: i64,
    /// Expiry date as printed on the card.
    pub expiry: String,
    /// Reference to the card image asset; doubles as the fulfillment
    /// download pointer.
    pub image_url: String,
    /// UPI id the buyer pays to.
    pub upi_id: String,
}

/// Read-only card lookup.
#[derive(Debug, Clone, Default)]
pub struct CardCatalog {
    cards: BTreeMap<u32, GiftCard>,
}

impl CardCatalog {
    /// Build a catalog from configured cards.
    ///
    /// # Errors
    ///
    /// Returns an error if two cards share an id.
    pub fn new(cards: Vec<GiftCard>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for card in cards {
            let id = card.id;
            if map.insert(id, card).is_some() {
                return Err(Error::Config(format!("duplicate card id {id} in catalog")));
            }
        }
        Ok(Self { cards: map })
    }

    /// Look up a card by id.
    #[must_use]
    pub fn get(&self, card_id: u32) -> Option<&GiftCard> {
        self.cards.get(&card_id)
    }

    /// Iterate all cards in id order.
    pub fn iter(&self) -> impl Iterator<Item = &GiftCard> {
        self.cards.values()
    }

    /// Number of cards in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the catalog has no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
