//! Device-class registry.
//!
//! Maps an advertised [`ModelId`] to a [`VariantDescriptor`]: the device kind,
//! its capability set and the protocol handler that speaks to it. Capability
//! sets are built from a named [`BaseProfile`] with [`CapabilityOverrides`]
//! layered on top, so a V2 revision is its base profile plus additions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::advertising::{
    ModelId, LEGACY_CARD_ID, LEGACY_FINDER2_ID, LEGACY_FINDER_ID, LEGACY_FOUND_ID,
    LEGACY_HONEY_ID, MFI_CARD_ID, MFI_CARD_V2_ID, MFI_CLIP_ID, MFI_CLIP_V2_ID, MFI_GREEN_ID,
    MFI_R4K_TAG_ID, MFI_TAG_ID, MFI_TAG_V2_ID, MFI_WHITE_ID,
};
use crate::ble::uuids::*;
use crate::protocol::{
    FinderHandler, FoundHandler, HandlerKind, HoneyHandler, MfiHandler, ProtocolHandler,
    UnknownHandler,
};

/// Time without an advertisement before a device is considered out of range.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(615);

/// Finder 2 broadcasts faster and goes stale sooner.
pub const FINDER2_STALE_TIMEOUT: Duration = Duration::from_secs(380);

/// Hardware product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// Honey.
    Honey,
    /// Finder.
    Finder,
    /// Finder 2.
    Finder2,
    /// Card.
    Card,
    /// Found (cellular).
    Found,
    /// MFi card.
    MfiCard,
    /// MFi clip.
    MfiClip,
    /// MFi tag.
    MfiTag,
    /// MFi white.
    MfiWhite,
    /// MFi green.
    MfiGreen,
    /// MFi R4K tag.
    MfiR4KTag,
    /// MFi card V2.
    MfiCardV2,
    /// MFi clip V2.
    MfiClipV2,
    /// MFi tag V2.
    MfiTagV2,
    /// Unidentified hardware.
    #[default]
    Unknown,
}

impl DeviceKind {
    /// Check if this is MFi hardware.
    pub fn is_mfi(&self) -> bool {
        matches!(
            self,
            Self::MfiCard
                | Self::MfiClip
                | Self::MfiTag
                | Self::MfiWhite
                | Self::MfiGreen
                | Self::MfiR4KTag
                | Self::MfiCardV2
                | Self::MfiClipV2
                | Self::MfiTagV2
        )
    }

    /// Check if this is a V2 revision.
    pub fn is_v2(&self) -> bool {
        matches!(self, Self::MfiCardV2 | Self::MfiClipV2 | Self::MfiTagV2)
    }

    /// Check if the device has a cellular modem.
    pub fn is_cellular(&self) -> bool {
        matches!(self, Self::Found)
    }

    /// Product name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Honey => "Honey",
            Self::Finder => "Finder",
            Self::Finder2 => "Finder 2.0",
            Self::Card => "Card",
            Self::Found => "Found",
            Self::MfiCard => "Card (MFi)",
            Self::MfiClip => "Clip",
            Self::MfiTag => "Tag",
            Self::MfiWhite => "White",
            Self::MfiGreen => "Green",
            Self::MfiR4KTag => "R4K Tag",
            Self::MfiCardV2 => "Card V2",
            Self::MfiClipV2 => "Clip V2",
            Self::MfiTagV2 => "Tag V2",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Named base profile a variant's capabilities start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BaseProfile {
    /// Connect and disconnect only.
    Minimal,
    /// Legacy finder family.
    Finder,
    /// Honey.
    Honey,
    /// Cellular finder.
    Cellular,
    /// MFi hardware.
    Mfi,
}

/// What a variant exposes and supports.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilitySet {
    /// Services requested during discovery. Empty means all.
    pub services: BTreeSet<Uuid>,
    /// Characteristics the variant is known to expose.
    pub characteristics: BTreeSet<Uuid>,
    /// Supports the wake write.
    pub supports_wake: bool,
    /// Supports ringing the buzzer.
    pub supports_buzz: bool,
    /// Reports battery level.
    pub reports_battery: bool,
    /// Reports temperature.
    pub reports_temperature: bool,
    /// Supports bonding.
    pub supports_bonding: bool,
    /// Time without an advertisement before the device is out of range.
    pub stale_timeout: Duration,
}

impl CapabilitySet {
    /// Capabilities of a base profile.
    pub fn for_profile(profile: BaseProfile) -> Self {
        let mut set = Self {
            services: BTreeSet::new(),
            characteristics: BTreeSet::new(),
            supports_wake: false,
            supports_buzz: false,
            reports_battery: false,
            reports_temperature: false,
            supports_bonding: false,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        };

        match profile {
            BaseProfile::Minimal => {}
            BaseProfile::Finder => {
                set.services
                    .extend([FINDER_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID]);
                set.characteristics
                    .extend([FINDER_DATA1_UUID, FINDER_DATA2_UUID, SOFTWARE_REVISION_UUID]);
                set.supports_wake = true;
                set.supports_buzz = true;
                set.reports_battery = true;
            }
            BaseProfile::Honey => {
                set.services.extend([
                    IMMEDIATE_ALERT_SERVICE_UUID,
                    LINK_LOSS_SERVICE_UUID,
                    BATTERY_SERVICE_UUID,
                    PROPRIETARY_TEMPERATURE_SERVICE_UUID,
                ]);
                set.characteristics.extend([
                    ALERT_LEVEL_UUID,
                    BATTERY_LEVEL_UUID,
                    PROPRIETARY_TEMPERATURE_UUID,
                ]);
                set.supports_buzz = true;
                set.reports_battery = true;
                set.reports_temperature = true;
            }
            BaseProfile::Cellular => {
                set.services.extend([
                    FINDER_SERVICE_UUID,
                    FOUND_SERVICE_UUID,
                    BATTERY_SERVICE_UUID,
                    ENVIRONMENTAL_SENSING_SERVICE_UUID,
                    DEVICE_INFO_SERVICE_UUID,
                ]);
                set.characteristics.extend([
                    FINDER_DATA1_UUID,
                    FINDER_DATA2_UUID,
                    FOUND_DATA3_UUID,
                    FOUND_DEBUG_MODE_UUID,
                    BATTERY_LEVEL_UUID,
                    TEMPERATURE_UUID,
                    SOFTWARE_REVISION_UUID,
                ]);
                set.supports_wake = true;
                set.supports_buzz = true;
                set.reports_battery = true;
                set.reports_temperature = true;
            }
            BaseProfile::Mfi => {
                set.services
                    .extend([FINDER_SERVICE_UUID, BATTERY_SERVICE_UUID]);
                set.characteristics.extend([
                    FINDER_DATA1_UUID,
                    FINDER_DATA2_UUID,
                    BATTERY_LEVEL_UUID,
                ]);
                set.supports_buzz = true;
                set.reports_battery = true;
            }
        }

        set
    }

    /// Apply overrides on top of this set.
    pub fn with_overrides(mut self, overrides: &CapabilityOverrides) -> Self {
        self.services.extend(overrides.add_services.iter().copied());
        self.characteristics
            .extend(overrides.add_characteristics.iter().copied());
        if let Some(v) = overrides.supports_wake {
            self.supports_wake = v;
        }
        if let Some(v) = overrides.supports_buzz {
            self.supports_buzz = v;
        }
        if let Some(v) = overrides.reports_battery {
            self.reports_battery = v;
        }
        if let Some(v) = overrides.reports_temperature {
            self.reports_temperature = v;
        }
        if let Some(v) = overrides.supports_bonding {
            self.supports_bonding = v;
        }
        if let Some(v) = overrides.stale_timeout {
            self.stale_timeout = v;
        }
        self
    }
}

/// Variant-specific changes to a base profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityOverrides {
    /// Extra services to discover.
    pub add_services: Vec<Uuid>,
    /// Extra characteristics exposed.
    pub add_characteristics: Vec<Uuid>,
    /// Override wake support.
    pub supports_wake: Option<bool>,
    /// Override buzz support.
    pub supports_buzz: Option<bool>,
    /// Override battery reporting.
    pub reports_battery: Option<bool>,
    /// Override temperature reporting.
    pub reports_temperature: Option<bool>,
    /// Override bonding support.
    pub supports_bonding: Option<bool>,
    /// Override the stale timeout.
    pub stale_timeout: Option<Duration>,
}

impl CapabilityOverrides {
    /// No overrides.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a service.
    pub fn add_service(mut self, service: Uuid) -> Self {
        self.add_services.push(service);
        self
    }

    /// Set bonding support.
    pub fn bonding(mut self, supported: bool) -> Self {
        self.supports_bonding = Some(supported);
        self
    }

    /// Set wake support.
    pub fn wake(mut self, supported: bool) -> Self {
        self.supports_wake = Some(supported);
        self
    }

    /// Set the stale timeout.
    pub fn stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }
}

/// Resolved description of a hardware variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDescriptor {
    /// Hardware product.
    pub kind: DeviceKind,
    /// Model identifier this descriptor was registered for.
    pub model: Option<ModelId>,
    /// Base profile the capabilities were built from.
    pub base: BaseProfile,
    /// Effective capabilities.
    pub capabilities: CapabilitySet,
    /// Protocol handler table key.
    pub handler: HandlerKind,
}

impl VariantDescriptor {
    /// Build a descriptor from a base profile and overrides.
    pub fn compose(
        kind: DeviceKind,
        model: Option<ModelId>,
        base: BaseProfile,
        overrides: &CapabilityOverrides,
        handler: HandlerKind,
    ) -> Self {
        Self {
            kind,
            model,
            base,
            capabilities: CapabilitySet::for_profile(base).with_overrides(overrides),
            handler,
        }
    }

    /// Descriptor used for hardware that could not be identified.
    pub fn fallback(model: Option<ModelId>) -> Self {
        Self::compose(
            DeviceKind::Unknown,
            model,
            BaseProfile::Minimal,
            &CapabilityOverrides::none(),
            HandlerKind::Unknown,
        )
    }

    /// Check if this is the fallback descriptor.
    pub fn is_fallback(&self) -> bool {
        self.kind == DeviceKind::Unknown
    }
}

/// Registry of known variants and their protocol handlers.
pub struct DeviceClassRegistry {
    variants: HashMap<ModelId, Arc<VariantDescriptor>>,
    handlers: HashMap<HandlerKind, Arc<dyn ProtocolHandler>>,
    fallback: Arc<VariantDescriptor>,
    unknown_handler: Arc<dyn ProtocolHandler>,
}

impl DeviceClassRegistry {
    /// Registry without any variants; every model resolves to the fallback.
    pub fn empty() -> Self {
        Self {
            variants: HashMap::new(),
            handlers: HashMap::new(),
            fallback: Arc::new(VariantDescriptor::fallback(None)),
            unknown_handler: Arc::new(UnknownHandler),
        }
    }

    /// Registry with every built-in variant and handler.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register_handler(Arc::new(FinderHandler));
        registry.register_handler(Arc::new(HoneyHandler));
        registry.register_handler(Arc::new(FoundHandler));
        registry.register_handler(Arc::new(MfiHandler::v1()));
        registry.register_handler(Arc::new(MfiHandler::v2()));

        let none = CapabilityOverrides::none();
        let v2 = CapabilityOverrides::none()
            .add_service(SMP_SERVICE_UUID)
            .bonding(true);
        let mfi_v1 = CapabilityOverrides::none().bonding(true);

        use BaseProfile as P;
        use DeviceKind as K;
        use HandlerKind as H;

        let legacy = [
            (LEGACY_HONEY_ID, K::Honey, P::Honey, none.clone(), H::Honey),
            (LEGACY_FINDER_ID, K::Finder, P::Finder, none.clone(), H::Finder),
            (
                LEGACY_FINDER2_ID,
                K::Finder2,
                P::Finder,
                CapabilityOverrides::none().stale_timeout(FINDER2_STALE_TIMEOUT),
                H::Finder,
            ),
            (LEGACY_CARD_ID, K::Card, P::Finder, none.clone(), H::Finder),
            (LEGACY_FOUND_ID, K::Found, P::Cellular, none.clone(), H::Found),
        ];
        for (id, kind, base, overrides, handler) in legacy {
            registry.register_variant(ModelId(id), kind, base, &overrides, handler);
        }

        let mfi = [
            (MFI_CARD_ID, K::MfiCard, mfi_v1.clone(), H::Mfi),
            (MFI_CLIP_ID, K::MfiClip, mfi_v1.clone(), H::Mfi),
            (MFI_TAG_ID, K::MfiTag, mfi_v1.clone(), H::Mfi),
            (MFI_WHITE_ID, K::MfiWhite, mfi_v1.clone(), H::Mfi),
            (MFI_GREEN_ID, K::MfiGreen, mfi_v1.clone(), H::Mfi),
            (
                MFI_R4K_TAG_ID,
                K::MfiR4KTag,
                mfi_v1.clone().add_service(R4K_TAG_SERVICE_UUID),
                H::Mfi,
            ),
            (MFI_CARD_V2_ID, K::MfiCardV2, v2.clone(), H::MfiV2),
            (MFI_CLIP_V2_ID, K::MfiClipV2, v2.clone(), H::MfiV2),
            (MFI_TAG_V2_ID, K::MfiTagV2, v2, H::MfiV2),
        ];
        for (id, kind, overrides, handler) in mfi {
            registry.register_variant(ModelId(u16::from(id)), kind, P::Mfi, &overrides, handler);
        }

        registry
    }

    /// Register or replace a variant.
    pub fn register_variant(
        &mut self,
        model: ModelId,
        kind: DeviceKind,
        base: BaseProfile,
        overrides: &CapabilityOverrides,
        handler: HandlerKind,
    ) -> Arc<VariantDescriptor> {
        let descriptor = Arc::new(VariantDescriptor::compose(
            kind,
            Some(model),
            base,
            overrides,
            handler,
        ));
        self.variants.insert(model, descriptor.clone());
        descriptor
    }

    /// Register or replace the handler for its kind.
    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Resolve a model identifier. Unknown or missing identifiers resolve to
    /// the fallback descriptor. Repeated calls return the same descriptor.
    pub fn resolve(&self, model: Option<ModelId>) -> Arc<VariantDescriptor> {
        model
            .and_then(|id| self.variants.get(&id).cloned())
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// The fallback descriptor.
    pub fn fallback(&self) -> Arc<VariantDescriptor> {
        self.fallback.clone()
    }

    /// Handler for a variant; variants without a registered handler get the
    /// no-op handler.
    pub fn handler_for(&self, variant: &VariantDescriptor) -> Arc<dyn ProtocolHandler> {
        self.handlers
            .get(&variant.handler)
            .cloned()
            .unwrap_or_else(|| self.unknown_handler.clone())
    }

    /// Number of registered variants.
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }
}

impl Default for DeviceClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClassRegistry")
            .field("variants", &self.variants.len())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = DeviceClassRegistry::new();
        let a = registry.resolve(Some(ModelId(LEGACY_FINDER_ID)));
        let b = registry.resolve(Some(ModelId(LEGACY_FINDER_ID)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.capabilities, b.capabilities);
        assert_eq!(a.kind, DeviceKind::Finder);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let registry = DeviceClassRegistry::new();
        let variant = registry.resolve(Some(ModelId(7)));
        assert!(variant.is_fallback());
        assert_eq!(variant.base, BaseProfile::Minimal);
        assert!(variant.capabilities.services.is_empty());
        assert!(!variant.capabilities.supports_wake);
        assert!(!variant.capabilities.reports_battery);
        assert_eq!(registry.handler_for(&variant).kind(), HandlerKind::Unknown);

        assert!(registry.resolve(None).is_fallback());
    }

    #[test]
    fn test_v2_supersets_base() {
        let registry = DeviceClassRegistry::new();
        let clip = registry.resolve(Some(ModelId(u16::from(MFI_CLIP_ID))));
        let clip_v2 = registry.resolve(Some(ModelId(u16::from(MFI_CLIP_V2_ID))));

        assert_eq!(clip_v2.base, clip.base);
        assert!(clip_v2.capabilities.services.is_superset(&clip.capabilities.services));
        assert!(clip_v2.capabilities.services.contains(&SMP_SERVICE_UUID));
        assert!(!clip.capabilities.services.contains(&SMP_SERVICE_UUID));
        assert_eq!(clip_v2.handler, HandlerKind::MfiV2);
    }

    #[test]
    fn test_mfi_card_is_mfi() {
        let registry = DeviceClassRegistry::new();
        let card = registry.resolve(Some(ModelId(u16::from(MFI_CARD_ID))));
        assert_eq!(card.kind, DeviceKind::MfiCard);
        assert!(card.kind.is_mfi());
    }

    #[test]
    fn test_finder2_stale_timeout() {
        let registry = DeviceClassRegistry::new();
        let finder = registry.resolve(Some(ModelId(LEGACY_FINDER_ID)));
        let finder2 = registry.resolve(Some(ModelId(LEGACY_FINDER2_ID)));
        assert_eq!(finder.capabilities.stale_timeout, DEFAULT_STALE_TIMEOUT);
        assert_eq!(finder2.capabilities.stale_timeout, FINDER2_STALE_TIMEOUT);
    }

    #[test]
    fn test_register_custom_variant() {
        let mut registry = DeviceClassRegistry::empty();
        assert!(registry.resolve(Some(ModelId(LEGACY_FINDER_ID))).is_fallback());

        registry.register_variant(
            ModelId(0x99),
            DeviceKind::Finder,
            BaseProfile::Finder,
            &CapabilityOverrides::none().wake(false),
            HandlerKind::Finder,
        );
        let variant = registry.resolve(Some(ModelId(0x99)));
        assert!(!variant.capabilities.supports_wake);

        // No handler registered yet for Finder in an empty registry.
        assert_eq!(registry.handler_for(&variant).kind(), HandlerKind::Unknown);
        registry.register_handler(Arc::new(FinderHandler));
        assert_eq!(registry.handler_for(&variant).kind(), HandlerKind::Finder);
    }

    #[test]
    fn test_builtin_table_size() {
        assert_eq!(DeviceClassRegistry::new().variant_count(), 14);
    }
}
