use super::{FallbackChain, Locator, LocatorStrategy};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LocatorFileError {
    #[error("unable to read locator file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid locator file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Every affordance the acquisition worker needs to find on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorChains {
    /// Listing detail panel; any one match means the page rendered.
    pub content_ready: FallbackChain,
    pub listing_image: FallbackChain,
    /// Hover targets that reveal the floating download control.
    pub gallery: FallbackChain,
    pub download_trigger: FallbackChain,
    pub download_all: FallbackChain,
}

static DEFAULT_CHAINS: Lazy<LocatorChains> = Lazy::new(|| LocatorChains {
    content_ready: chain(&[
        ("details_header", Locator::css("div.lot-details-header")),
        ("details_testid", Locator::css("div[data-testid='lotDetails']")),
    ]),
    listing_image: chain(&[
        ("platform_image", Locator::css("img[src*='copart']")),
        ("any_image", Locator::css("img")),
    ]),
    gallery: chain(&[
        ("image_container", Locator::css("div.lot-image-container")),
        ("first_image", Locator::css("img")),
    ]),
    download_trigger: chain(&[
        (
            "floating_cta_icon",
            Locator::css("a.lot-image-floating-CTA span.download-image-sprite-icon"),
        ),
        (
            "header_sprite_span",
            Locator::css("span.lot-details-header-sprite.download-image-sprite-icon"),
        ),
        (
            "svg_download_button",
            Locator::css("button:has(svg[aria-label='download'])"),
        ),
        (
            "sprite_button",
            Locator::css("button.download-image-sprite-icon"),
        ),
        (
            "header_sprite_div",
            Locator::css("div.lot-details-header-sprite.download-image-sprite-icon"),
        ),
        ("sprite_span", Locator::css("span.download-image-sprite-icon")),
        (
            "role_button_svg",
            Locator::css("div[role='button'] svg[aria-label*='Download']"),
        ),
        ("aria_button", Locator::css("button[aria-label*='Download']")),
        ("text_download_images", Locator::text("Download Images")),
    ]),
    download_all: chain(&[
        (
            "anchor_download_all",
            Locator::xpath("//a[contains(normalize-space(.), 'Download all')]"),
        ),
        ("text_download_all", Locator::text("Download all")),
        ("href_download", Locator::css("a[href*='Download']")),
        ("header_anchor", Locator::css("div.lot-details-header a")),
    ]),
});

fn chain(entries: &[(&str, Locator)]) -> FallbackChain {
    FallbackChain::new(
        entries
            .iter()
            .map(|(name, locator)| LocatorStrategy::new(name, locator.clone()))
            .collect(),
    )
}

/// On-disk overrides; any chain left out keeps its built-in default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocatorFile {
    content_ready: Option<FallbackChain>,
    listing_image: Option<FallbackChain>,
    gallery: Option<FallbackChain>,
    download_trigger: Option<FallbackChain>,
    download_all: Option<FallbackChain>,
}

impl Default for LocatorChains {
    fn default() -> Self {
        DEFAULT_CHAINS.clone()
    }
}

impl LocatorChains {
    pub fn load(path: Option<&Path>) -> Result<Self, LocatorFileError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|source| LocatorFileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let chains = Self::from_yaml(&raw).map_err(|source| LocatorFileError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!(
            target = "scout.browser",
            path = %path.display(),
            download_trigger = chains.download_trigger.strategies().len(),
            download_all = chains.download_all.strategies().len(),
            "locator_chains_loaded"
        );
        Ok(chains)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        let file: LocatorFile = serde_yaml::from_str(raw)?;
        let mut chains = Self::default();
        let overrides = [
            (&mut chains.content_ready, file.content_ready),
            (&mut chains.listing_image, file.listing_image),
            (&mut chains.gallery, file.gallery),
            (&mut chains.download_trigger, file.download_trigger),
            (&mut chains.download_all, file.download_all),
        ];
        for (slot, replacement) in overrides {
            if let Some(replacement) = replacement.filter(|c| !c.is_empty()) {
                *slot = replacement;
            }
        }
        Ok(chains)
    }
}
