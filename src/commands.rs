//! Command handlers and dispatch.
//!
//! Token 0 of a request picks the handler; each handler checks its own
//! arity and argument shapes. Handlers run on the serving thread with
//! exclusive access to the keyspace, so there is no locking here; the
//! only cross-thread traffic is handing detached entries to the worker
//! pool for disposal.

use std::collections::VecDeque;

use tracing::debug;

use crate::buf::Buf;
use crate::db::{Db, Entry, LARGE_CONTAINER_SIZE, Value};
use crate::hll::Hll;
use crate::hmap::HMap;
use crate::pool::ThreadPool;
use crate::protocol::{
    Response, begin_arr, end_arr, out_arr, out_dbl, out_err, out_int, out_nil, out_not_found,
    out_str, rsp_begin, rsp_end,
};
use crate::zset::ZSet;

/// A bitmap may not grow beyond this many bytes via SETBIT.
const BITMAP_MAX_BYTES: usize = 64 << 20;

/// Everything the handlers operate on: the keyspace plus the disposal
/// pool.
pub struct Shared {
    pub db: Db,
    pub pool: ThreadPool,
}

impl Shared {
    pub fn new(num_threads: usize) -> Self {
        Self {
            db: Db::new(),
            pool: ThreadPool::new(num_threads),
        }
    }

    /// Drop a detached entry, off-thread when its teardown would be
    /// expensive enough to notice in the event loop.
    pub fn dispose(&self, entry: Entry) {
        if entry.val.teardown_weight() >= LARGE_CONTAINER_SIZE {
            debug!(key = ?String::from_utf8_lossy(&entry.key), "disposing large container off-thread");
            self.pool.submit(move || drop(entry));
        }
    }
}

/// Handle one parsed request, appending a complete response frame.
pub fn dispatch(shared: &mut Shared, args: &[Vec<u8>], now: u64, out: &mut Buf) {
    let rsp = rsp_begin(out);
    let Some((name, argv)) = args.split_first() else {
        out_err(out, &rsp, "empty command");
        rsp_end(out, rsp);
        return;
    };
    match (name.as_slice(), argv.len()) {
        (b"get", 1) => do_get(shared, &argv[0], out, &rsp),
        (b"set", 2) => do_set(shared, &argv[0], &argv[1], out),
        (b"del", 1) => do_del(shared, &argv[0], out),
        (b"keys", 0) => do_keys(shared, out),
        (b"zadd", 3) => do_zadd(shared, argv, out, &rsp),
        (b"zscore", 2) => do_zscore(shared, argv, out, &rsp),
        (b"zrem", 2) => do_zrem(shared, argv, out, &rsp),
        (b"zquery", 5) => do_zquery(shared, argv, out, &rsp),
        (b"expire", 2) => do_expire(shared, argv, now, out, &rsp),
        (b"ttl", 1) => do_ttl(shared, &argv[0], now, out),
        (b"persist", 1) => do_persist(shared, &argv[0], out),
        (b"hset", 3) => do_hset(shared, argv, out, &rsp),
        (b"hget", 2) => do_hget(shared, argv, out, &rsp),
        (b"hgetall", 1) => do_hgetall(shared, &argv[0], out, &rsp),
        (b"hdel", 2) => do_hdel(shared, argv, out, &rsp),
        (b"lpush", n) if n >= 2 => do_push(shared, argv, true, out, &rsp),
        (b"rpush", n) if n >= 2 => do_push(shared, argv, false, out, &rsp),
        (b"lpop", 1) => do_pop(shared, &argv[0], true, out, &rsp),
        (b"rpop", 1) => do_pop(shared, &argv[0], false, out, &rsp),
        (b"lrange", 3) => do_lrange(shared, argv, out, &rsp),
        (b"sadd", n) if n >= 2 => do_sadd(shared, argv, out, &rsp),
        (b"srem", n) if n >= 2 => do_srem(shared, argv, out, &rsp),
        (b"smembers", 1) => do_smembers(shared, &argv[0], out, &rsp),
        (b"scard", 1) => do_scard(shared, &argv[0], out, &rsp),
        (b"setbit", 3) => do_setbit(shared, argv, out, &rsp),
        (b"getbit", 2) => do_getbit(shared, argv, out, &rsp),
        (b"bitcount", 1 | 3) => do_bitcount(shared, argv, out, &rsp),
        (b"pfadd", n) if n >= 2 => do_pfadd(shared, argv, out, &rsp),
        (b"pfcount", 1) => do_pfcount(shared, &argv[0], out, &rsp),
        (b"pfmerge", n) if n >= 2 => do_pfmerge(shared, argv, out, &rsp),
        _ => out_err(out, &rsp, "unknown command or wrong number of arguments"),
    }
    rsp_end(out, rsp);
}

fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let v: f64 = s.parse().ok()?;
    (!v.is_nan()).then_some(v)
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Fetch the value at `key` as type `T`, optionally creating it.
///
/// `Ok(None)`: key absent and not created. `Err(())`: key holds a
/// different type.
fn typed_mut<'a, T>(
    db: &'a mut Db,
    key: &[u8],
    create: Option<fn() -> Value>,
    project: fn(&mut Value) -> Option<&mut T>,
) -> Result<Option<&'a mut T>, ()> {
    if db.get(key).is_none() {
        match create {
            Some(make) => db.insert(key.to_vec(), make()),
            None => return Ok(None),
        }
    }
    let Some(entry) = db.get_mut(key) else {
        return Ok(None);
    };
    project(&mut entry.val).map(Some).ok_or(())
}

fn as_zset(val: &mut Value) -> Option<&mut ZSet> {
    match val {
        Value::ZSet(z) => Some(z),
        _ => None,
    }
}

fn as_hash(val: &mut Value) -> Option<&mut HMap<Vec<u8>, Vec<u8>>> {
    match val {
        Value::Hash(h) => Some(h),
        _ => None,
    }
}

fn as_list(val: &mut Value) -> Option<&mut VecDeque<Vec<u8>>> {
    match val {
        Value::List(l) => Some(l),
        _ => None,
    }
}

fn as_set(val: &mut Value) -> Option<&mut HMap<Vec<u8>, ()>> {
    match val {
        Value::Set(s) => Some(s),
        _ => None,
    }
}

fn as_bitmap(val: &mut Value) -> Option<&mut Vec<u8>> {
    match val {
        Value::Bitmap(b) => Some(b),
        _ => None,
    }
}

fn as_hll(val: &mut Value) -> Option<&mut Hll> {
    match val {
        Value::Hll(h) => Some(h),
        _ => None,
    }
}

/// Containers vanish with their last element; a later command on the
/// key sees a clean miss instead of an empty shell.
fn drop_if_empty(shared: &mut Shared, key: &[u8]) {
    let empty = match shared.db.get(key).map(|e| &e.val) {
        Some(Value::ZSet(z)) => z.is_empty(),
        Some(Value::Hash(h)) => h.is_empty(),
        Some(Value::List(l)) => l.is_empty(),
        Some(Value::Set(s)) => s.is_empty(),
        _ => false,
    };
    if empty {
        if let Some(entry) = shared.db.remove(key) {
            shared.dispose(entry);
        }
    }
}

fn do_get(shared: &mut Shared, key: &[u8], out: &mut Buf, rsp: &Response) {
    match shared.db.get(key).map(|e| &e.val) {
        Some(Value::Str(s)) => out_str(out, s),
        Some(_) => out_err(out, rsp, "expect string"),
        None => out_not_found(out, rsp),
    }
}

/// SET always replaces whole entries, so the old value (whatever its
/// type) is detached for disposal and any pending TTL is gone.
fn do_set(shared: &mut Shared, key: &[u8], val: &[u8], out: &mut Buf) {
    if let Some(old) = shared.db.remove(key) {
        shared.dispose(old);
    }
    shared.db.insert(key.to_vec(), Value::Str(val.to_vec()));
    out_nil(out);
}

fn do_del(shared: &mut Shared, key: &[u8], out: &mut Buf) {
    match shared.db.remove(key) {
        Some(old) => {
            shared.dispose(old);
            out_int(out, 1);
        }
        None => out_int(out, 0),
    }
}

fn do_keys(shared: &Shared, out: &mut Buf) {
    out_arr(out, shared.db.len() as u32);
    for key in shared.db.keys() {
        out_str(out, key);
    }
}

fn do_zadd(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let Some(score) = parse_f64(&argv[1]) else {
        out_err(out, rsp, "expect float");
        return;
    };
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::ZSet(ZSet::new())), as_zset) {
        Ok(Some(zset)) => out_int(out, i64::from(zset.insert(score, &argv[2]))),
        Ok(None) => unreachable!("zadd creates its key"),
        Err(()) => out_err(out, rsp, "expect zset"),
    }
}

fn do_zscore(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], None, as_zset) {
        Ok(Some(zset)) => match zset.score(&argv[1]) {
            Some(score) => out_dbl(out, score),
            None => out_not_found(out, rsp),
        },
        Ok(None) => out_not_found(out, rsp),
        Err(()) => out_err(out, rsp, "expect zset"),
    }
}

fn do_zrem(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], None, as_zset) {
        Ok(Some(zset)) => {
            let removed = zset.remove(&argv[1]);
            drop_if_empty(shared, &argv[0]);
            out_int(out, i64::from(removed));
        }
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect zset"),
    }
}

/// zquery key score name offset limit: range scan starting at the first
/// member `>= (score, name)`, shifted by `offset`. Pairs go out as
/// (score, name), so the element count is twice the member count.
fn do_zquery(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let Some(score) = parse_f64(&argv[1]) else {
        out_err(out, rsp, "expect float");
        return;
    };
    let (Some(offset), Some(limit)) = (parse_i64(&argv[3]), parse_i64(&argv[4])) else {
        out_err(out, rsp, "expect int");
        return;
    };
    let zset = match typed_mut(&mut shared.db, &argv[0], None, as_zset) {
        Ok(Some(zset)) => zset,
        Ok(None) => {
            out_arr(out, 0);
            return;
        }
        Err(()) => {
            out_err(out, rsp, "expect zset");
            return;
        }
    };

    let pos = begin_arr(out);
    let mut n = 0u32;
    let mut cur = zset
        .seekge(score, &argv[2])
        .and_then(|id| zset.offset(id, offset));
    while let Some(id) = cur {
        if i64::from(n / 2) >= limit {
            break;
        }
        let item = zset.item(id).expect("walk yields live nodes");
        out_dbl(out, item.score.0);
        out_str(out, &item.name);
        n += 2;
        cur = zset.offset(id, 1);
    }
    end_arr(out, pos, n);
}

/// expire key seconds. Non-positive durations disarm the timer instead
/// of deleting the key.
fn do_expire(shared: &mut Shared, argv: &[Vec<u8>], now: u64, out: &mut Buf, rsp: &Response) {
    let Some(secs) = parse_i64(&argv[1]) else {
        out_err(out, rsp, "expect int");
        return;
    };
    let armed = if secs > 0 {
        // Saturate instead of overflowing on absurd durations; the
        // deadline is effectively "never".
        let at = secs
            .checked_mul(1000)
            .map_or(u64::MAX, |ms| now.saturating_add(ms as u64));
        shared.db.set_ttl(&argv[0], at)
    } else {
        shared.db.clear_ttl(&argv[0])
    };
    out_int(out, i64::from(armed));
}

/// ttl key: seconds remaining rounded up, -1 when the key has no timer,
/// -2 when the key does not exist.
fn do_ttl(shared: &Shared, key: &[u8], now: u64, out: &mut Buf) {
    match shared.db.ttl_remaining(key, now) {
        None => out_int(out, -2),
        Some(None) => out_int(out, -1),
        Some(Some(ms)) => out_int(out, ms.div_ceil(1000) as i64),
    }
}

fn do_persist(shared: &mut Shared, key: &[u8], out: &mut Buf) {
    let had_ttl = shared.db.ttl_remaining(key, 0).flatten().is_some();
    if had_ttl {
        shared.db.clear_ttl(key);
    }
    out_int(out, i64::from(had_ttl));
}

fn do_hset(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::Hash(HMap::new())), as_hash) {
        Ok(Some(hash)) => match hash.get_mut(&argv[1]) {
            Some(slot) => {
                *slot = argv[2].clone();
                out_int(out, 0);
            }
            None => {
                hash.insert(argv[1].clone(), argv[2].clone());
                out_int(out, 1);
            }
        },
        Ok(None) => unreachable!("hset creates its key"),
        Err(()) => out_err(out, rsp, "expect hash"),
    }
}

fn do_hget(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], None, as_hash) {
        Ok(Some(hash)) => match hash.get(&argv[1]) {
            Some(val) => out_str(out, val),
            None => out_not_found(out, rsp),
        },
        Ok(None) => out_not_found(out, rsp),
        Err(()) => out_err(out, rsp, "expect hash"),
    }
}

fn do_hgetall(shared: &mut Shared, key: &[u8], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, key, None, as_hash) {
        Ok(Some(hash)) => {
            out_arr(out, hash.len() as u32 * 2);
            // Iteration borrows the map immutably; typed_mut's &mut is done.
            for (field, val) in hash.iter() {
                out_str(out, field);
                out_str(out, val);
            }
        }
        Ok(None) => out_arr(out, 0),
        Err(()) => out_err(out, rsp, "expect hash"),
    }
}

fn do_hdel(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], None, as_hash) {
        Ok(Some(hash)) => {
            let removed = hash.remove(&argv[1]).is_some();
            drop_if_empty(shared, &argv[0]);
            out_int(out, i64::from(removed));
        }
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect hash"),
    }
}

fn do_push(shared: &mut Shared, argv: &[Vec<u8>], front: bool, out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::List(VecDeque::new())), as_list) {
        Ok(Some(list)) => {
            for val in &argv[1..] {
                if front {
                    list.push_front(val.clone());
                } else {
                    list.push_back(val.clone());
                }
            }
            out_int(out, list.len() as i64);
        }
        Ok(None) => unreachable!("push creates its key"),
        Err(()) => out_err(out, rsp, "expect list"),
    }
}

fn do_pop(shared: &mut Shared, key: &[u8], front: bool, out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, key, None, as_list) {
        Ok(Some(list)) => {
            let popped = if front {
                list.pop_front()
            } else {
                list.pop_back()
            };
            match popped {
                Some(val) => {
                    drop_if_empty(shared, key);
                    out_str(out, &val);
                }
                None => out_not_found(out, rsp),
            }
        }
        Ok(None) => out_not_found(out, rsp),
        Err(()) => out_err(out, rsp, "expect list"),
    }
}

/// lrange key start stop, inclusive; negative indexes count from the
/// tail.
fn do_lrange(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let (Some(start), Some(stop)) = (parse_i64(&argv[1]), parse_i64(&argv[2])) else {
        out_err(out, rsp, "expect int");
        return;
    };
    match typed_mut(&mut shared.db, &argv[0], None, as_list) {
        Ok(Some(list)) => {
            let len = list.len() as i64;
            let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let start = clamp(start) as usize;
            let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
            if stop < start as i64 {
                out_arr(out, 0);
                return;
            }
            let stop = stop as usize;
            out_arr(out, (stop - start + 1) as u32);
            for val in list.iter().skip(start).take(stop - start + 1) {
                out_str(out, val);
            }
        }
        Ok(None) => out_arr(out, 0),
        Err(()) => out_err(out, rsp, "expect list"),
    }
}

fn do_sadd(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::Set(HMap::new())), as_set) {
        Ok(Some(set)) => {
            let mut added = 0i64;
            for member in &argv[1..] {
                if !set.contains(member) {
                    set.insert(member.clone(), ());
                    added += 1;
                }
            }
            out_int(out, added);
        }
        Ok(None) => unreachable!("sadd creates its key"),
        Err(()) => out_err(out, rsp, "expect set"),
    }
}

fn do_srem(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], None, as_set) {
        Ok(Some(set)) => {
            let mut removed = 0i64;
            for member in &argv[1..] {
                if set.remove(member).is_some() {
                    removed += 1;
                }
            }
            drop_if_empty(shared, &argv[0]);
            out_int(out, removed);
        }
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect set"),
    }
}

fn do_smembers(shared: &mut Shared, key: &[u8], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, key, None, as_set) {
        Ok(Some(set)) => {
            out_arr(out, set.len() as u32);
            for member in set.keys() {
                out_str(out, member);
            }
        }
        Ok(None) => out_arr(out, 0),
        Err(()) => out_err(out, rsp, "expect set"),
    }
}

fn do_scard(shared: &mut Shared, key: &[u8], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, key, None, as_set) {
        Ok(Some(set)) => out_int(out, set.len() as i64),
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect set"),
    }
}

/// setbit key offset bit: returns the previous bit. The bitmap grows
/// on demand, zero-filled, up to a hard byte cap.
fn do_setbit(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let Some(offset) = parse_i64(&argv[1]).filter(|&v| v >= 0) else {
        out_err(out, rsp, "expect non-negative int");
        return;
    };
    let bit = match argv[2].as_slice() {
        b"0" => 0u8,
        b"1" => 1u8,
        _ => {
            out_err(out, rsp, "expect 0 or 1");
            return;
        }
    };
    let byte = offset as usize / 8;
    if byte >= BITMAP_MAX_BYTES {
        out_err(out, rsp, "bit offset out of range");
        return;
    }
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::Bitmap(Vec::new())), as_bitmap) {
        Ok(Some(bitmap)) => {
            if byte >= bitmap.len() {
                bitmap.resize(byte + 1, 0);
            }
            let mask = 1u8 << (offset % 8);
            let old = u8::from(bitmap[byte] & mask != 0);
            if bit == 1 {
                bitmap[byte] |= mask;
            } else {
                bitmap[byte] &= !mask;
            }
            out_int(out, i64::from(old));
        }
        Ok(None) => unreachable!("setbit creates its key"),
        Err(()) => out_err(out, rsp, "expect bitmap"),
    }
}

fn do_getbit(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let Some(offset) = parse_i64(&argv[1]).filter(|&v| v >= 0) else {
        out_err(out, rsp, "expect non-negative int");
        return;
    };
    match typed_mut(&mut shared.db, &argv[0], None, as_bitmap) {
        Ok(Some(bitmap)) => {
            let byte = offset as usize / 8;
            let bit = bitmap
                .get(byte)
                .is_some_and(|b| b & (1 << (offset % 8)) != 0);
            out_int(out, i64::from(bit));
        }
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect bitmap"),
    }
}

/// bitcount key [start end]: population count, optionally over an
/// inclusive byte range; negative indexes count from the last byte.
fn do_bitcount(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    let range = if argv.len() == 3 {
        match (parse_i64(&argv[1]), parse_i64(&argv[2])) {
            (Some(start), Some(stop)) => Some((start, stop)),
            _ => {
                out_err(out, rsp, "expect int");
                return;
            }
        }
    } else {
        None
    };
    match typed_mut(&mut shared.db, &argv[0], None, as_bitmap) {
        Ok(Some(bitmap)) => {
            let len = bitmap.len() as i64;
            let (start, stop) = range.unwrap_or((0, len - 1));
            let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i };
            let (start, stop) = (clamp(start), clamp(stop).min(len - 1));
            let ones: u32 = if start <= stop {
                bitmap[start as usize..=stop as usize]
                    .iter()
                    .map(|b| b.count_ones())
                    .sum()
            } else {
                0
            };
            out_int(out, i64::from(ones));
        }
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect bitmap"),
    }
}

fn do_pfadd(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::Hll(Hll::new())), as_hll) {
        Ok(Some(hll)) => {
            let mut changed = false;
            for elem in &argv[1..] {
                changed |= hll.add(elem);
            }
            out_int(out, i64::from(changed));
        }
        Ok(None) => unreachable!("pfadd creates its key"),
        Err(()) => out_err(out, rsp, "expect hyperloglog"),
    }
}

fn do_pfcount(shared: &mut Shared, key: &[u8], out: &mut Buf, rsp: &Response) {
    match typed_mut(&mut shared.db, key, None, as_hll) {
        Ok(Some(hll)) => out_int(out, hll.count() as i64),
        Ok(None) => out_int(out, 0),
        Err(()) => out_err(out, rsp, "expect hyperloglog"),
    }
}

/// pfmerge dest src...: union the sources into dest. Missing sources
/// count as empty; the destination is created if absent.
fn do_pfmerge(shared: &mut Shared, argv: &[Vec<u8>], out: &mut Buf, rsp: &Response) {
    // Type-check everything before mutating anything.
    for key in argv {
        if let Some(entry) = shared.db.get(key) {
            if !matches!(entry.val, Value::Hll(_)) {
                out_err(out, rsp, "expect hyperloglog");
                return;
            }
        }
    }
    let sources: Vec<Hll> = argv[1..]
        .iter()
        .filter_map(|key| match shared.db.get(key).map(|e| &e.val) {
            Some(Value::Hll(h)) => Some(h.clone()),
            _ => None,
        })
        .collect();
    match typed_mut(&mut shared.db, &argv[0], Some(|| Value::Hll(Hll::new())), as_hll) {
        Ok(Some(dest)) => {
            for src in &sources {
                dest.merge(src);
            }
            out_nil(out);
        }
        Ok(None) => unreachable!("pfmerge creates its destination"),
        Err(()) => out_err(out, rsp, "expect hyperloglog"),
    }
}
