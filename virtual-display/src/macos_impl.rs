// src/macos_impl.rs (only compiled on macOS)
use cocoa::base::{id, nil};
use cocoa::foundation::{NSArray, NSAutoreleasePool, NSString};
use core_graphics::display::{CGDirectDisplayID, CGDisplay};
use core_graphics::geometry::CGSize;
use objc::runtime::{Class, Object};
use objc::{msg_send, sel, sel_impl};
use std::ffi::c_void;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::platform::{
    DeviceBackend, DeviceDescriptor, ManagedIdentity, ModeSettings, Platform,
    ReconfigurationHandler, ReconfigurationNotifier, TerminationCallback, TopologyInspector,
    TopologyRepairer, VirtualDevice,
};
use crate::topology::{DisplayInfo, Rect, TopologySnapshot};

// Link to macOS frameworks
#[link(name = "Cocoa", kind = "framework")]
extern "C" {}

type CGDisplayConfigRef = *mut c_void;
type ReconfigurationCallback = extern "C" fn(CGDirectDisplayID, u32, *mut c_void);

const CONFIGURE_FOR_SESSION: u32 = 1;
const NULL_DIRECT_DISPLAY: CGDirectDisplayID = 0;
const MAX_DISPLAYS: u32 = 32;

#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {
    fn CGGetOnlineDisplayList(max: u32, displays: *mut CGDirectDisplayID, count: *mut u32) -> i32;
    fn CGBeginDisplayConfiguration(config: *mut CGDisplayConfigRef) -> i32;
    fn CGConfigureDisplayMirrorOfDisplay(
        config: CGDisplayConfigRef,
        display: CGDirectDisplayID,
        master: CGDirectDisplayID,
    ) -> i32;
    fn CGConfigureDisplayOrigin(
        config: CGDisplayConfigRef,
        display: CGDirectDisplayID,
        x: i32,
        y: i32,
    ) -> i32;
    fn CGCompleteDisplayConfiguration(config: CGDisplayConfigRef, option: u32) -> i32;
    fn CGCancelDisplayConfiguration(config: CGDisplayConfigRef) -> i32;
    fn CGDisplayRegisterReconfigurationCallback(
        callback: ReconfigurationCallback,
        user_info: *mut c_void,
    ) -> i32;
    fn CGDisplayRemoveReconfigurationCallback(
        callback: ReconfigurationCallback,
        user_info: *mut c_void,
    ) -> i32;
}

/// Backend for the private CGVirtualDisplay API.
pub fn platform() -> Platform {
    Platform {
        backend: Arc::new(CoreGraphicsBackend),
        inspector: Arc::new(CoreGraphicsInspector),
        repairer: Arc::new(CoreGraphicsRepairer),
        notifier: Some(Arc::new(CoreGraphicsNotifier::default())),
    }
}

fn online_display_ids() -> Option<Vec<CGDirectDisplayID>> {
    let mut ids = [0 as CGDirectDisplayID; MAX_DISPLAYS as usize];
    let mut count = 0u32;
    let err = unsafe { CGGetOnlineDisplayList(MAX_DISPLAYS, ids.as_mut_ptr(), &mut count) };
    if err != 0 {
        log::warn!("CGGetOnlineDisplayList failed: {}", err);
        return None;
    }
    Some(ids[..count as usize].to_vec())
}

fn identity_of(display: &CGDisplay) -> ManagedIdentity {
    ManagedIdentity {
        vendor_id: display.vendor_number(),
        product_id: display.model_number(),
        serial_number: display.serial_number(),
    }
}

/// A wrapper for an ObjC pointer so it can move to the run loop thread.
#[derive(Debug)]
struct ObjcPtr(*mut Object);

// The display objects are only messaged from the owning handle and released
// once by the run loop thread after the handle is gone.
unsafe impl Send for ObjcPtr {}
unsafe impl Sync for ObjcPtr {}

struct DisplayObjects {
    descriptor: ObjcPtr,
    display: ObjcPtr,
}

impl DisplayObjects {
    unsafe fn release(&self) {
        let _: () = msg_send![self.display.0, release];
        let _: () = msg_send![self.descriptor.0, release];
    }
}

struct CoreGraphicsBackend;

impl DeviceBackend for CoreGraphicsBackend {
    fn create_device(
        &self,
        descriptor: &DeviceDescriptor,
        on_terminated: TerminationCallback,
    ) -> Option<Box<dyn VirtualDevice>> {
        let _pool = unsafe { NSAutoreleasePool::new(nil) };

        let descriptor_cls = Class::get("CGVirtualDisplayDescriptor")?;
        let display_cls = Class::get("CGVirtualDisplay")?;

        let cg_descriptor: *mut Object = unsafe {
            let alloc: *mut Object = msg_send![descriptor_cls, alloc];
            msg_send![alloc, init]
        };
        if cg_descriptor.is_null() {
            return None;
        }

        unsafe {
            let name: id = NSString::alloc(nil).init_str(&descriptor.name);
            let _: () = msg_send![cg_descriptor, setName: name];
            let _: () = msg_send![cg_descriptor, setMaxPixelsWide: descriptor.max_pixels_wide];
            let _: () = msg_send![cg_descriptor, setMaxPixelsHigh: descriptor.max_pixels_high];

            let (width_mm, height_mm) = descriptor.size_millimeters;
            let size = CGSize::new(width_mm as f64, height_mm as f64);
            let _: () = msg_send![cg_descriptor, setSizeInMillimeters: size];

            let _: () = msg_send![cg_descriptor, setProductID: descriptor.identity.product_id];
            let _: () = msg_send![cg_descriptor, setVendorID: descriptor.identity.vendor_id];
            let _: () = msg_send![cg_descriptor, setSerialNum: descriptor.identity.serial_number];
        }

        let display: *mut Object = unsafe {
            let alloc: *mut Object = msg_send![display_cls, alloc];
            msg_send![alloc, initWithDescriptor: cg_descriptor]
        };
        if display.is_null() {
            log::warn!("CGVirtualDisplay rejected \"{}\"", descriptor.name);
            unsafe {
                let _: () = msg_send![cg_descriptor, release];
            }
            return None;
        }

        let display_id: CGDirectDisplayID = unsafe { msg_send![display, displayID] };
        log::debug!("Created virtual display \"{}\", ID = {}", descriptor.name, display_id);

        let objects = Arc::new(DisplayObjects {
            descriptor: ObjcPtr(cg_descriptor),
            display: ObjcPtr(display),
        });
        spawn_keepalive(Arc::clone(&objects), display_id, on_terminated);

        Some(Box::new(CoreGraphicsDevice {
            objects,
            display_id,
        }))
    }
}

/// Keeps the display objects alive until the device handle is dropped, then
/// releases them and reports termination once the display leaves the online
/// list.
fn spawn_keepalive(
    objects: Arc<DisplayObjects>,
    display_id: CGDirectDisplayID,
    on_terminated: TerminationCallback,
) {
    thread::spawn(move || {
        let _pool = unsafe { NSAutoreleasePool::new(nil) };
        log::debug!("Virtual display {} run loop started", display_id);

        while Arc::strong_count(&objects) > 1 {
            thread::sleep(Duration::from_millis(100));
        }
        unsafe { objects.release() };
        drop(objects);

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let online = online_display_ids().map_or(true, |ids| ids.contains(&display_id));
            if !online {
                log::debug!("Virtual display {} terminated", display_id);
                on_terminated();
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("Virtual display {} still online after release", display_id);
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    });
}

struct CoreGraphicsDevice {
    objects: Arc<DisplayObjects>,
    display_id: CGDirectDisplayID,
}

impl VirtualDevice for CoreGraphicsDevice {
    fn display_id(&self) -> u32 {
        self.display_id
    }

    fn apply(&mut self, settings: &ModeSettings) -> bool {
        let _pool = unsafe { NSAutoreleasePool::new(nil) };
        let (Some(settings_cls), Some(mode_cls)) = (
            Class::get("CGVirtualDisplaySettings"),
            Class::get("CGVirtualDisplayMode"),
        ) else {
            return false;
        };

        unsafe {
            let cg_settings: *mut Object = msg_send![settings_cls, new];
            let _: () = msg_send![cg_settings, setHiDPI: settings.hi_dpi as u32];

            let modes: Vec<id> = settings
                .modes
                .iter()
                .map(|m| {
                    let alloc: *mut Object = msg_send![mode_cls, alloc];
                    let mode: id = msg_send![alloc, initWithWidth:m.width as u64
                                                           height:m.height as u64
                                                      refreshRate:m.refresh_rate];
                    let _: id = msg_send![mode, autorelease];
                    mode
                })
                .collect();
            let modes_array: id = NSArray::arrayWithObjects(nil, &modes);
            let _: () = msg_send![cg_settings, setModes: modes_array];

            let success: bool = msg_send![self.objects.display.0, applySettings: cg_settings];
            let _: () = msg_send![cg_settings, release];
            log::debug!("applySettings on display {}: {}", self.display_id, success);
            success
        }
    }
}

struct CoreGraphicsInspector;

impl TopologyInspector for CoreGraphicsInspector {
    fn snapshot(
        &self,
        tracked_serials: &[u32],
        vendor_id: u32,
        product_id: u32,
    ) -> Option<TopologySnapshot> {
        let displays = online_display_ids()?
            .into_iter()
            .map(|display_id| {
                let display = CGDisplay::new(display_id);
                let identity = identity_of(&display);
                let bounds = display.bounds();
                let master = display.mirrors_display();
                DisplayInfo {
                    id: display_id,
                    serial_number: identity.serial_number,
                    is_managed_virtual_device: identity.vendor_id == vendor_id
                        && identity.product_id == product_id
                        && tracked_serials.contains(&identity.serial_number),
                    is_in_mirror_set: display.is_in_mirror_set(),
                    mirror_master_id: (master != NULL_DIRECT_DISPLAY).then_some(master),
                    bounds: Rect::new(
                        bounds.origin.x as i32,
                        bounds.origin.y as i32,
                        bounds.size.width as u32,
                        bounds.size.height as u32,
                    ),
                }
            })
            .collect();
        Some(TopologySnapshot {
            main_display_id: CGDisplay::main().id,
            displays,
        })
    }

    fn is_display_online(&self, identity: ManagedIdentity) -> bool {
        online_display_ids()
            .map(|ids| {
                ids.into_iter()
                    .any(|display_id| identity_of(&CGDisplay::new(display_id)) == identity)
            })
            .unwrap_or(false)
    }
}

struct CoreGraphicsRepairer;

impl TopologyRepairer for CoreGraphicsRepairer {
    /// Pulls every managed display out of mirroring and lays them out in a
    /// row to the right of the anchor.
    fn repair(&self, snapshot: &TopologySnapshot, managed_ids: &[u32], anchor_id: u32) -> bool {
        let Some(anchor) = snapshot.display(anchor_id) else {
            return false;
        };
        let mut config: CGDisplayConfigRef = std::ptr::null_mut();
        if unsafe { CGBeginDisplayConfiguration(&mut config) } != 0 {
            return false;
        }

        let mut x = anchor.bounds.x + anchor.bounds.width as i32;
        let mut ok = true;
        for id in managed_ids {
            let Some(display) = snapshot.display(*id) else {
                continue;
            };
            ok &= unsafe { CGConfigureDisplayMirrorOfDisplay(config, *id, NULL_DIRECT_DISPLAY) } == 0;
            if *id == anchor_id {
                continue;
            }
            ok &= unsafe { CGConfigureDisplayOrigin(config, *id, x, anchor.bounds.y) } == 0;
            x += display.bounds.width as i32;
        }

        if !ok {
            unsafe { CGCancelDisplayConfiguration(config) };
            return false;
        }
        unsafe { CGCompleteDisplayConfiguration(config, CONFIGURE_FOR_SESSION) == 0 }
    }
}

#[derive(Default)]
struct CoreGraphicsNotifier {
    registered: Mutex<Option<usize>>,
}

extern "C" fn on_display_reconfigured(_display: CGDirectDisplayID, _flags: u32, user_info: *mut c_void) {
    let handler = unsafe { &*(user_info as *const ReconfigurationHandler) };
    handler();
}

impl ReconfigurationNotifier for CoreGraphicsNotifier {
    fn start(&self, handler: ReconfigurationHandler) -> bool {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if registered.is_some() {
            return true;
        }
        let user_info = Box::into_raw(Box::new(handler));
        let err = unsafe {
            CGDisplayRegisterReconfigurationCallback(on_display_reconfigured, user_info as *mut c_void)
        };
        if err != 0 {
            drop(unsafe { Box::from_raw(user_info) });
            return false;
        }
        *registered = Some(user_info as usize);
        true
    }

    fn stop(&self) {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user_info) = registered.take() {
            let ptr = user_info as *mut ReconfigurationHandler;
            unsafe {
                CGDisplayRemoveReconfigurationCallback(on_display_reconfigured, ptr as *mut c_void);
                drop(Box::from_raw(ptr));
            }
        }
    }
}
