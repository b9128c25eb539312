//! Topology checks around enable, rebuild and disable.

use tokio::time::{self, Instant};

use crate::coordinator::Inner;
use crate::error::DisplayError;
use crate::topology::{evaluate, select_anchor, TopologySnapshot};

impl Inner {
    fn sample_topology(&self) -> Option<TopologySnapshot> {
        let tracked = self.lock().store.serials();
        self.platform
            .inspector
            .snapshot(&tracked, self.settings.vendor_id, self.settings.product_id)
    }

    /// Samples until two consecutive snapshots agree or the stability timeout
    /// passes. A missing sample breaks the streak like a changed one would.
    pub(crate) async fn await_stable_topology(&self) -> Option<TopologySnapshot> {
        let deadline = Instant::now() + self.settings.stability_timeout();
        let interval = self.settings.stability_poll_interval();
        let mut previous = None;
        let mut samples = 0u32;
        loop {
            let sample = self.sample_topology();
            samples += 1;
            if let Some(snapshot) = sample {
                let signature = snapshot.signature();
                if previous.as_ref() == Some(&signature) {
                    log::debug!("Topology stable after {} sample(s)", samples);
                    return Some(snapshot);
                }
                previous = Some(signature);
            } else {
                previous = None;
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!("Topology still changing after {} sample(s)", samples);
                return None;
            }
            time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Waits for a stable topology and repairs it if it is unhealthy.
    pub(crate) async fn verify_topology_after_enable(&self) -> Result<(), DisplayError> {
        let snapshot = self
            .await_stable_topology()
            .await
            .ok_or(DisplayError::TopologyUnstableAfterEnable)?;

        let desired = self.lock().store.desired_serials();
        let evaluation = evaluate(&snapshot, &desired);
        let forced = evaluation.force_normalization && self.settings.repair_on_forced_normalization;
        if evaluation.issue.is_none() && !forced {
            return Ok(());
        }

        let preferred = self
            .settings
            .preferred_main_serial
            .and_then(|serial| snapshot.managed_display_for_serial(serial))
            .map(|d| d.id);
        let anchor = select_anchor(&snapshot, &evaluation.managed_display_ids, preferred)
            .ok_or(DisplayError::TopologyRepairFailed)?;
        log::warn!(
            "Repairing display topology ({:?}, forced normalization {}) around display {}",
            evaluation.issue,
            evaluation.force_normalization,
            anchor
        );
        if self
            .platform
            .repairer
            .repair(&snapshot, &evaluation.managed_display_ids, anchor)
        {
            Ok(())
        } else {
            Err(DisplayError::TopologyRepairFailed)
        }
    }

    /// Refuses to disable the display with `serial` while it is main and no
    /// other viable display could take over.
    pub(crate) fn check_disable_safety(&self, serial: u32) -> Result<(), DisplayError> {
        let snapshot = self
            .sample_topology()
            .ok_or(DisplayError::DisableSafetyCheckUnavailable)?;
        let Some(display) = snapshot.managed_display_for_serial(serial) else {
            return Ok(());
        };
        if display.id != snapshot.main_display_id {
            return Ok(());
        }

        let desired = self.lock().store.desired_serials();
        let fallback = snapshot.displays.iter().any(|d| {
            d.id != display.id
                && d.is_viable()
                && (!d.is_managed_virtual_device
                    || (d.serial_number != serial && desired.contains(&d.serial_number)))
        });
        if fallback {
            Ok(())
        } else {
            Err(DisplayError::CannotDisableCurrentMainWithoutFallback)
        }
    }

    pub(crate) fn check_not_main(&self, serial: u32) -> Result<(), DisplayError> {
        let snapshot = self
            .sample_topology()
            .ok_or(DisplayError::DisableSafetyCheckUnavailable)?;
        match snapshot.managed_display_for_serial(serial) {
            Some(display) if display.id == snapshot.main_display_id => {
                Err(DisplayError::RebuildMainDisplayWhileRunning)
            }
            _ => Ok(()),
        }
    }
}
