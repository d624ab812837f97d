use crate::client::Link;
use crate::connection::Connection;
use crate::error::{QrcError, Result};
use crate::protocol::{ChangeDelta, ComponentInfo, ControlInfo, GetControlsResult};
use crate::subscription::{ComponentUpdateReceiver, ControlChangeReceiver, Subscription};
use crate::types::{ControlSnapshot, Direction, Property};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// A named, typed unit of the running design
///
/// Cheap to clone; all clones share the same live state. Components are
/// cached by name and evicted wholesale when the design code changes.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

struct ComponentInner {
    name: String,
    component_type: String,
    properties: Vec<Property>,
    /// Controls in natural name order, unique names
    controls: Mutex<Vec<Control>>,
    updated_tx: broadcast::Sender<Vec<Control>>,
}

impl Component {
    pub(crate) fn new(info: ComponentInfo) -> Self {
        let (updated_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(ComponentInner {
                name: info.name,
                component_type: info.component_type,
                properties: info.properties,
                controls: Mutex::new(Vec::new()),
                updated_tx,
            }),
        }
    }

    /// Component name as it appears in the design
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Component type reported by the core
    pub fn component_type(&self) -> &str {
        &self.inner.component_type
    }

    /// Descriptive properties in the order the core reported them
    pub fn properties(&self) -> Vec<Property> {
        self.inner.properties.clone()
    }

    /// All controls, in natural name order
    pub fn controls(&self) -> Vec<Control> {
        self.inner.controls.lock().unwrap().clone()
    }

    /// Look up a control by name
    pub fn control(&self, name: &str) -> Option<Control> {
        self.inner
            .controls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Subscribe to batches of controls changed by a single poll
    pub fn updated(&self) -> ComponentUpdateReceiver {
        Subscription::new(self.inner.updated_tx.subscribe())
    }

    pub(crate) fn control_names(&self) -> Vec<String> {
        self.inner
            .controls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Replace the control set from a `Component.GetControls` result
    pub(crate) fn set_controls(&self, link: &Arc<Link>, infos: Vec<ControlInfo>) {
        let mut controls: Vec<Control> = Vec::with_capacity(infos.len());
        for info in infos {
            if controls.iter().any(|c| c.name() == info.name) {
                tracing::warn!(
                    "Duplicate control {} on component {}, keeping the first",
                    info.name,
                    self.inner.name
                );
                continue;
            }
            controls.push(Control::new(link.clone(), &self.inner.name, info));
        }
        controls.sort_by(|a, b| natural_cmp(a.name(), b.name()));
        *self.inner.controls.lock().unwrap() = controls;
    }

    /// Apply one poll's deltas for this component
    ///
    /// Returns the controls whose cached state actually changed; emits the
    /// per-component batch event when the batch is non-empty.
    pub(crate) fn apply_changes(&self, deltas: &[&ChangeDelta]) -> Vec<Control> {
        let mut changed = Vec::new();
        for delta in deltas {
            let Some(control) = self.control(&delta.name) else {
                tracing::debug!(
                    "Change for unknown control {}.{}",
                    self.inner.name,
                    delta.name
                );
                continue;
            };
            if control.apply(delta) {
                changed.push(control);
            }
        }
        if !changed.is_empty() {
            let _ = self.inner.updated_tx.send(changed.clone());
        }
        changed
    }
}

/// A single readable (and possibly writable) value within a component
///
/// Cheap to clone. Cached fields are mutated only by server-pushed change
/// deltas and by the confirmatory poll after a local write; consumers read
/// snapshots and write through the methods here.
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    link: Arc<Link>,
    /// Owning component's name; lookup back-reference, not ownership
    component: String,
    name: String,
    control_type: String,
    direction: Direction,
    value_min: f64,
    value_max: f64,
    string_min: String,
    string_max: String,
    state: Mutex<ControlState>,
    changed_tx: broadcast::Sender<ControlSnapshot>,
}

struct ControlState {
    value: Value,
    string: String,
    position: f64,
}

impl Control {
    pub(crate) fn new(link: Arc<Link>, component: &str, info: ControlInfo) -> Self {
        let (changed_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(ControlInner {
                link,
                component: component.to_string(),
                name: info.name,
                control_type: info.control_type,
                direction: Direction::parse(info.direction.as_deref()),
                value_min: info.value_min,
                value_max: info.value_max,
                string_min: info.string_min,
                string_max: info.string_max,
                state: Mutex::new(ControlState {
                    value: info.value,
                    string: info.string,
                    position: info.position,
                }),
                changed_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the owning component
    pub fn component(&self) -> &str {
        &self.inner.component
    }

    pub fn control_type(&self) -> &str {
        &self.inner.control_type
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// True when the control's direction is read/write
    pub fn can_write(&self) -> bool {
        self.inner.direction.can_write()
    }

    /// Current cached value
    pub fn value(&self) -> Value {
        self.inner.state.lock().unwrap().value.clone()
    }

    /// Current cached string representation
    pub fn string(&self) -> String {
        self.inner.state.lock().unwrap().string.clone()
    }

    /// Current cached position (0..1)
    pub fn position(&self) -> f64 {
        self.inner.state.lock().unwrap().position
    }

    pub fn value_min(&self) -> f64 {
        self.inner.value_min
    }

    pub fn value_max(&self) -> f64 {
        self.inner.value_max
    }

    pub fn string_min(&self) -> &str {
        &self.inner.string_min
    }

    pub fn string_max(&self) -> &str {
        &self.inner.string_max
    }

    /// Consistent copy of every field for rendering
    pub fn snapshot(&self) -> ControlSnapshot {
        let state = self.inner.state.lock().unwrap();
        ControlSnapshot {
            component: self.inner.component.clone(),
            name: self.inner.name.clone(),
            control_type: self.inner.control_type.clone(),
            direction: self.inner.direction,
            value: state.value.clone(),
            string: state.string.clone(),
            position: state.position,
            value_min: self.inner.value_min,
            value_max: self.inner.value_max,
            string_min: self.inner.string_min.clone(),
            string_max: self.inner.string_max.clone(),
        }
    }

    /// Subscribe to this control's change events
    pub fn changed(&self) -> ControlChangeReceiver {
        Subscription::new(self.inner.changed_tx.subscribe())
    }

    /// Set the control's native value
    pub async fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        self.write(json!({ "Value": value.into() })).await
    }

    /// Set the value with a ramped transition, in seconds (0 = immediate)
    pub async fn ramp_value(&self, value: impl Into<Value>, ramp_seconds: f64) -> Result<()> {
        self.write(json!({ "Value": value.into(), "Ramp": ramp_seconds }))
            .await
    }

    /// Set the normalized 0..1 position
    pub async fn set_position(&self, position: f64) -> Result<()> {
        self.write(json!({ "Position": position })).await
    }

    /// Set the position with a ramped transition, in seconds (0 = immediate)
    pub async fn ramp_position(&self, position: f64, ramp_seconds: f64) -> Result<()> {
        self.write(json!({ "Position": position, "Ramp": ramp_seconds }))
            .await
    }

    /// Fire a trigger control
    pub async fn trigger(&self) -> Result<()> {
        self.write(json!({ "Value": 1 })).await
    }

    /// Issue a `Component.Set` for this control
    ///
    /// Read-only controls are refused locally, before any wire traffic. On
    /// success the confirmatory change-group poll is scheduled so the cache
    /// converges on the authoritative post-write value.
    async fn write(&self, mut fields: Value) -> Result<()> {
        if !self.inner.direction.can_write() {
            return Err(QrcError::ReadOnly(self.inner.name.clone()));
        }
        let conn = self.inner.link.current()?;

        fields["Name"] = json!(self.inner.name);
        let params = json!({
            "Name": self.inner.component,
            "Controls": [fields],
        });
        conn.request("Component.Set", params, self.inner.link.options.request_timeout)
            .await?;

        self.inner.link.schedule_repoll();
        Ok(())
    }

    /// Merge a change delta into the cached state
    ///
    /// Only fields present in the delta are touched, and only when the new
    /// value differs from the cached one. Boolean controls coerce the wire's
    /// truthy/falsy forms so `1`/`true` compare equal.
    pub(crate) fn apply(&self, delta: &ChangeDelta) -> bool {
        let mut changed = false;
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(value) = &delta.value {
                let is_bool =
                    self.inner.control_type == "Boolean" || state.value.is_boolean();
                let incoming = if is_bool {
                    Value::Bool(truthy(value))
                } else {
                    value.clone()
                };
                if incoming != state.value {
                    state.value = incoming;
                    changed = true;
                }
            }
            if let Some(string) = &delta.string {
                if *string != state.string {
                    state.string = string.clone();
                    changed = true;
                }
            }
            if let Some(position) = delta.position {
                if position != state.position {
                    state.position = position;
                    changed = true;
                }
            }
        }
        if changed {
            let _ = self.inner.changed_tx.send(self.snapshot());
        }
        changed
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        _ => true,
    }
}

/// Fetch the component list, optionally with each component's controls
pub(crate) async fn fetch_components(
    conn: &Connection,
    link: &Arc<Link>,
    with_controls: bool,
) -> Result<Vec<Component>> {
    let result = conn
        .request(
            "Component.GetComponents",
            json!({}),
            link.options.request_timeout,
        )
        .await?;
    let infos: Vec<ComponentInfo> = serde_json::from_value(result)?;

    let mut components: Vec<Component> = infos.into_iter().map(Component::new).collect();
    components.sort_by(|a, b| natural_cmp(a.name(), b.name()));

    if with_controls {
        for component in &components {
            fetch_controls(conn, link, component).await?;
        }
    }
    Ok(components)
}

/// Fetch and install one component's controls
pub(crate) async fn fetch_controls(
    conn: &Connection,
    link: &Arc<Link>,
    component: &Component,
) -> Result<()> {
    let result = conn
        .request(
            "Component.GetControls",
            json!({ "Name": component.name() }),
            link.options.request_timeout,
        )
        .await?;
    let parsed: GetControlsResult = serde_json::from_value(result)?;
    component.set_controls(link, parsed.controls);
    Ok(())
}

/// Alphabetical ordering that compares digit runs numerically
/// (so `input 2` sorts before `input 10`), case-insensitively
pub(crate) fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();
    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let run_a = take_digits(&mut ca);
                let run_b = take_digits(&mut cb);
                let ord = cmp_digit_runs(&run_a, &run_b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let lx = x.to_lowercase().next().unwrap_or(x);
                let ly = y.to_lowercase().next().unwrap_or(y);
                if lx != ly {
                    return lx.cmp(&ly);
                }
                ca.next();
                cb.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars>) -> String {
    let mut run = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn cmp_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
