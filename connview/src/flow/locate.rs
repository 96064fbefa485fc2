//! Local location
//!
//! Records whose coordinates the backend could not resolve are drawn at
//! the location of this host. It is looked up once, trying the backend
//! first and then the platform, and cached by the registry.

use super::model::Location;
use crate::remote::{Backend, RemoteError};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LocationResolutionError {
    #[error("no source could tell where this host is")]
    Unavailable,
    #[error("backend lookup failed: {0}")]
    Backend(#[from] RemoteError),
}

/// Something that can tell where this host is.
pub trait LocationService {
    fn locate(&self) -> Result<Location, LocationResolutionError>;
}

/// Asks the backend to geolocate the public address of this host.
pub struct BackendLookup<'a, B: Backend + ?Sized> {
    backend: &'a B,
    address: &'a str,
}

impl<'a, B: Backend + ?Sized> BackendLookup<'a, B> {
    pub fn new(backend: &'a B, address: &'a str) -> Self {
        BackendLookup { backend, address }
    }
}

impl<B: Backend + ?Sized> LocationService for BackendLookup<'_, B> {
    fn locate(&self) -> Result<Location, LocationResolutionError> {
        let location = self.backend.lookup_location(self.address)?;
        if location.is_zero() {
            return Err(LocationResolutionError::Unavailable);
        }
        Ok(location)
    }
}

/// The platform location of this rendition: coordinates configured by the
/// user.
pub struct ConfiguredLocation(pub Option<Location>);

impl LocationService for ConfiguredLocation {
    fn locate(&self) -> Result<Location, LocationResolutionError> {
        self.0.ok_or(LocationResolutionError::Unavailable)
    }
}

/// Runs the fallback chain and remembers whether a failure was already
/// reported.
#[derive(Debug, Default)]
pub struct LocalLocator {
    warned: bool,
}

impl LocalLocator {
    pub fn new() -> LocalLocator {
        Self::default()
    }

    /// Returns the first location a service produces. Failure is not fatal:
    /// records just stay without coordinates.
    pub fn resolve(
        &mut self,
        services: &[&dyn LocationService],
    ) -> Result<Location, LocationResolutionError> {
        let mut last_err = LocationResolutionError::Unavailable;
        for service in services {
            match service.locate() {
                Ok(location) => {
                    tracing::debug!(?location, "local location resolved");
                    return Ok(location);
                }
                Err(e) => last_err = e,
            }
        }
        if !self.warned {
            tracing::warn!(error = %last_err, "could not determine local location");
            self.warned = true;
        }
        Err(last_err)
    }

    /// Backend lookup of the configured public address (skipped when none
    /// is set), then the configured coordinates.
    pub fn resolve_with<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        settings: &Settings,
    ) -> Result<Location, LocationResolutionError> {
        let configured = ConfiguredLocation(settings.fallback_location);
        if settings.public_address.is_empty() {
            self.resolve(&[&configured])
        } else {
            let lookup = BackendLookup::new(backend, &settings.public_address);
            self.resolve(&[&lookup, &configured])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockBackend;

    #[test]
    fn backend_first_then_configured() {
        let backend = MockBackend::new();
        backend.set_location("203.0.113.7", Location::new(2.35, 48.85));
        let mut settings = Settings {
            public_address: "203.0.113.7".into(),
            fallback_location: Some(Location::new(1.0, 1.0)),
            ..Default::default()
        };
        let mut locator = LocalLocator::new();
        assert_eq!(
            locator.resolve_with(&backend, &settings).unwrap(),
            Location::new(2.35, 48.85)
        );

        backend.fail("LookupLocation");
        assert_eq!(
            locator.resolve_with(&backend, &settings).unwrap(),
            Location::new(1.0, 1.0)
        );

        settings.fallback_location = None;
        let err = locator.resolve_with(&backend, &settings).unwrap_err();
        assert!(matches!(err, LocationResolutionError::Backend(_)));
        assert!(locator.warned);
    }

    #[test]
    fn no_sources_is_unavailable() {
        let backend = MockBackend::new();
        let mut locator = LocalLocator::new();
        assert_eq!(
            locator.resolve_with(&backend, &Settings::default()),
            Err(LocationResolutionError::Unavailable)
        );
        assert!(!backend.calls().contains(&"LookupLocation"));
    }
}
