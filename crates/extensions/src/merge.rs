//! In-place editing of loosely ordered sequences where entries are identified
//! by a key: command line flags by prefix, and environment variables, volume
//! mounts, volumes, containers and unit options by name.
//!
//! All `ensure_*` functions are idempotent. A replaced entry keeps its index,
//! new entries are appended, and when several entries match the first one
//! wins.

use k8s_openapi::api::core::v1::{Container, EnvVar, Volume, VolumeMount};

use crate::unit::UnitOption;

/// Returns the index of the first item equal to `value`.
pub fn string_index(items: &[String], value: &str) -> Option<usize> {
    items.iter().position(|item| item == value)
}

/// Returns the index of the first item starting with `prefix`.
pub fn string_with_prefix_index(items: &[String], prefix: &str) -> Option<usize> {
    items.iter().position(|item| item.starts_with(prefix))
}

/// Ensures `value` is present, appending it if missing.
pub fn ensure_string(items: &mut Vec<String>, value: &str) {
    if string_index(items, value).is_none() {
        items.push(value.to_owned());
    }
}

/// Removes the first item equal to `value`.
pub fn ensure_no_string(items: &mut Vec<String>, value: &str) {
    if let Some(i) = string_index(items, value) {
        items.remove(i);
    }
}

/// Ensures exactly one item starts with `prefix` and that it equals
/// `prefix + value`. An existing item is replaced at its index.
pub fn ensure_string_with_prefix(items: &mut Vec<String>, prefix: &str, value: &str) {
    let wanted = format!("{}{}", prefix, value);
    match string_with_prefix_index(items, prefix) {
        Some(i) => {
            if items[i] != wanted {
                items[i] = wanted;
            }
            let mut seen = false;
            items.retain(|item| {
                if !item.starts_with(prefix) {
                    return true;
                }
                let keep = !seen;
                seen = true;
                keep
            });
        }
        None => items.push(wanted),
    }
}

/// Removes the first item starting with `prefix`.
pub fn ensure_no_string_with_prefix(items: &mut Vec<String>, prefix: &str) {
    if let Some(i) = string_with_prefix_index(items, prefix) {
        items.remove(i);
    }
}

fn split_values<'a>(item: &'a str, prefix: &str, sep: &str) -> Vec<&'a str> {
    item[prefix.len()..]
        .split(sep)
        .filter(|v| !v.is_empty())
        .collect()
}

/// Treats the suffix of the item starting with `prefix` as a `sep` delimited
/// set and ensures it contains `value`. Appends `prefix + value` if no item
/// starts with `prefix`.
pub fn ensure_string_with_prefix_contains(
    items: &mut Vec<String>,
    prefix: &str,
    value: &str,
    sep: &str,
) {
    match string_with_prefix_index(items, prefix) {
        Some(i) => {
            let mut values = split_values(&items[i], prefix, sep);
            if !values.contains(&value) {
                values.push(value);
                items[i] = format!("{}{}", prefix, values.join(sep));
            }
        }
        None => items.push(format!("{}{}", prefix, value)),
    }
}

/// Removes `value` from the `sep` delimited set held by the item starting with
/// `prefix`. The item itself is kept, even if its set becomes empty.
pub fn ensure_no_string_with_prefix_contains(
    items: &mut [String],
    prefix: &str,
    value: &str,
    sep: &str,
) {
    if let Some(i) = string_with_prefix_index(items, prefix) {
        let mut values = split_values(&items[i], prefix, sep);
        if let Some(j) = values.iter().position(|v| *v == value) {
            values.remove(j);
            items[i] = format!("{}{}", prefix, values.join(sep));
        }
    }
}

/// Entries identified by their name.
pub trait Named {
    /// The identifying name.
    fn name(&self) -> &str;
}

impl Named for EnvVar {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for VolumeMount {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for Volume {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for Container {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Returns the index of the first entry called `name`.
pub fn named_index<T: Named>(items: &[T], name: &str) -> Option<usize> {
    items.iter().position(|item| item.name() == name)
}

/// Returns a mutable reference to the first entry called `name`.
pub fn find_named<'a, T: Named>(items: &'a mut [T], name: &str) -> Option<&'a mut T> {
    items.iter_mut().find(|item| item.name() == name)
}

/// Ensures an entry equal to `item` exists. An entry with the same name that
/// differs in any field is replaced at its index.
pub fn ensure_named<T: Named + PartialEq>(items: &mut Vec<T>, item: T) {
    match named_index(items, item.name()) {
        Some(i) => {
            if items[i] != item {
                items[i] = item;
            }
        }
        None => items.push(item),
    }
}

/// Removes the first entry called `name`.
pub fn ensure_no_named<T: Named>(items: &mut Vec<T>, name: &str) {
    if let Some(i) = named_index(items, name) {
        items.remove(i);
    }
}

/// Ensures the environment variable exists with exactly these fields.
pub fn ensure_env_var(container: &mut Container, env: EnvVar) {
    ensure_named(container.env.get_or_insert_with(Vec::new), env);
}

/// Ensures the volume mount exists with exactly these fields.
pub fn ensure_volume_mount(container: &mut Container, mount: VolumeMount) {
    ensure_named(container.volume_mounts.get_or_insert_with(Vec::new), mount);
}

/// Ensures the volume exists with exactly these fields.
pub fn ensure_volume(volumes: &mut Option<Vec<Volume>>, volume: Volume) {
    ensure_named(volumes.get_or_insert_with(Vec::new), volume);
}

/// Returns the index of the first unit option matching section and name.
pub fn unit_option_index(options: &[UnitOption], section: &str, name: &str) -> Option<usize> {
    options
        .iter()
        .position(|o| o.section == section && o.name == name)
}

/// Returns a mutable reference to the first unit option matching section and
/// name.
pub fn unit_option_with_section_and_name<'a>(
    options: &'a mut [UnitOption],
    section: &str,
    name: &str,
) -> Option<&'a mut UnitOption> {
    options
        .iter_mut()
        .find(|o| o.section == section && o.name == name)
}

/// Ensures the unit option exists with exactly this value.
pub fn ensure_unit_option(options: &mut Vec<UnitOption>, option: UnitOption) {
    match unit_option_index(options, &option.section, &option.name) {
        Some(i) => {
            if options[i] != option {
                options[i] = option;
            }
        }
        None => options.push(option),
    }
}

/// Removes the first unit option matching section and name.
pub fn ensure_no_unit_option(options: &mut Vec<UnitOption>, section: &str, name: &str) {
    if let Some(i) = unit_option_index(options, section, name) {
        options.remove(i);
    }
}
