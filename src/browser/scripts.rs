//! Page-side JavaScript used by the Chromium provider.
//!
//! Element references live in a registry on the top window (`window.__slot`).
//! A reload replaces the window object, so every reference taken before it
//! fails with "stale element reference" on next use. Ids start from the
//! registry's creation time in microseconds, so a fresh registry never hands
//! out an id an older one used.

use serde_json::Value;

const PRELUDE: &str = r#"(window.__slot || (window.__slot = (function () {
  const S = { seq: Date.now() * 1000, refs: new Map() };
  S.reg = function (el) {
    if (el.__slotId && S.refs.get(el.__slotId) === el) return el.__slotId;
    const id = ++S.seq;
    el.__slotId = id;
    S.refs.set(id, el);
    return id;
  };
  S.get = function (id) {
    const el = S.refs.get(id);
    if (!el || !el.isConnected) throw new Error('stale element reference: ' + id);
    return el;
  };
  S.doc = function (path) {
    let d = document;
    for (const id of path) {
      const f = S.get(id);
      let cd = null;
      try { cd = f.contentDocument; } catch (e) { cd = null; }
      if (!cd) throw new Error('stale element reference: frame ' + id);
      d = cd;
    }
    return d;
  };
  S.norm = function (s) { return (s || '').replace(/\s+/g, ' ').trim(); };
  S.text = function (el) {
    if (el.tagName.toLowerCase() === 'input') return S.norm(el.value);
    return S.norm(el.innerText !== undefined ? el.innerText : el.textContent);
  };
  S.view = function (el) {
    return { id: S.reg(el), tag: el.tagName.toLowerCase(), text: S.text(el) };
  };
  S.accepts = function (el, p) {
    const tag = el.tagName.toLowerCase();
    if (p.tags.length && !p.tags.includes(tag)) return false;
    if (tag === 'input' && p.input_types.length) {
      const ty = (el.getAttribute('type') || '').trim().toLowerCase();
      if (!p.input_types.includes(ty)) return false;
    }
    if (p.class_contains !== null && !(el.getAttribute('class') || '').includes(p.class_contains)) return false;
    if (p.ancestor_class !== null) {
      let a = el.parentElement, ok = false;
      while (a) {
        if ((a.getAttribute('class') || '').includes(p.ancestor_class)) { ok = true; break; }
        a = a.parentElement;
      }
      if (!ok) return false;
    }
    for (const [attr, needle] of p.attr_contains) {
      const v = el.getAttribute(attr);
      if (v === null || !v.toLowerCase().includes(needle)) return false;
    }
    return true;
  };
  S.query = function (path, scope, p) {
    const root = scope ? S.get(scope) : S.doc(path);
    const sel = p.tags.length ? p.tags.join(',') : '*';
    return Array.from(root.querySelectorAll(sel)).filter(el => S.accepts(el, p)).map(S.view);
  };
  S.visibleText = function (path, id) {
    if (id) return S.text(S.get(id));
    const d = S.doc(path);
    return d.body ? S.norm(d.body.innerText) : '';
  };
  S.displayed = function (id) {
    const el = S.get(id);
    const st = el.ownerDocument.defaultView.getComputedStyle(el);
    if (st.display === 'none' || st.visibility === 'hidden') return false;
    return el.getClientRects().length > 0;
  };
  S.parent = function (id) {
    const p = S.get(id).parentElement;
    return p ? S.view(p) : null;
  };
  S.attr = function (id, name) { return S.get(id).getAttribute(name); };
  S.scroll = function (id) { S.get(id).scrollIntoView({ block: 'center' }); return true; };
  S.clickPoint = function (id) {
    const el = S.get(id);
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) throw new Error('element not clickable: zero size');
    const cx = r.left + r.width / 2, cy = r.top + r.height / 2;
    const top = el.ownerDocument.elementFromPoint(cx, cy);
    if (top && top !== el && !el.contains(top) && !top.contains(el)) {
      throw new Error('click intercepted by <' + top.tagName.toLowerCase() + '>');
    }
    let x = cx, y = cy, w = el.ownerDocument.defaultView;
    while (w && w.frameElement) {
      const fr = w.frameElement.getBoundingClientRect();
      x += fr.left; y += fr.top;
      w = w.parent;
    }
    return { x: x, y: y };
  };
  S.scriptClick = function (id) { S.get(id).click(); return true; };
  S.setValue = function (id, v) {
    const el = S.get(id);
    el.focus && el.focus();
    const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
    if (desc && desc.set) desc.set.call(el, v); else el.value = v;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
  };
  S.selectOption = function (id, v) {
    const el = S.get(id);
    const opt = Array.from(el.options || []).find(o => o.value === v);
    if (!opt) throw new Error('option not found: ' + v);
    el.value = v;
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
  };
  S.submit = function (id) {
    HTMLFormElement.prototype.submit.call(S.get(id));
    return true;
  };
  S.label = function (el) {
    const doc = el.ownerDocument;
    const eid = el.getAttribute('id');
    if (eid) {
      const l = doc.querySelector('label[for="' + CSS.escape(eid) + '"]');
      if (l) return S.text(l);
    }
    const wrap = el.closest('label');
    if (wrap) return S.text(wrap);
    let best = null;
    for (const l of doc.querySelectorAll('label')) {
      if (l.compareDocumentPosition(el) & Node.DOCUMENT_POSITION_FOLLOWING) best = l; else break;
    }
    return best ? S.text(best) : '';
  };
  S.fields = function (formId) {
    const form = S.get(formId);
    return Array.from(form.querySelectorAll('input,select,textarea')).map(el => {
      const tag = el.tagName.toLowerCase();
      const ty = (el.getAttribute('type') || '').toLowerCase();
      const toggle = tag === 'input' && (ty === 'checkbox' || ty === 'radio');
      return {
        control: S.view(el),
        tag: tag,
        input_type: ty,
        name: el.getAttribute('name') || '',
        id: el.getAttribute('id') || '',
        placeholder: el.getAttribute('placeholder') || '',
        label: S.label(el),
        required: el.hasAttribute('required'),
        value: toggle ? (el.getAttribute('value') || '') : (el.value || ''),
        checked: !!el.checked,
        readonly: el.hasAttribute('readonly'),
        disabled: !!el.disabled,
        options: tag === 'select'
          ? Array.from(el.options).map(o => ({ value: o.value, text: S.norm(o.text), selected: o.selected }))
          : []
      };
    });
  };
  S.frames = function (path) {
    return Array.from(S.doc(path).querySelectorAll('iframe,frame')).map(S.view);
  };
  S.enterFrame = function (id) {
    const f = S.get(id);
    let cd = null;
    try { cd = f.contentDocument; } catch (e) { cd = null; }
    if (!cd) throw new Error('frame document unavailable (cross-origin or detached)');
    return true;
  };
  S.source = function (path) {
    const d = S.doc(path);
    return d.documentElement ? d.documentElement.outerHTML : '';
  };
  S.call = function (op, args) { return S[op].apply(null, args); };
  return S;
})()))"#;

/// Build an expression that calls `op` on the page registry with `args`.
pub fn call(op: &str, args: &[Value]) -> String {
    let args = Value::Array(args.to_vec());
    format!("(() => {PRELUDE}.call({}, {}))()", Value::from(op), args)
}

/// Re-routes `window.open` and `target=_blank` anchors into the current tab.
/// Idempotent per document.
pub const SAME_TAB_POLICY: &str = r#"(() => {
  try {
    if (window.__sameTab) return true;
    window.__sameTab = true;
    window.open = function (url) {
      try { if (url) window.location.assign(url); } catch (e) {}
      return null;
    };
    document.addEventListener('click', function (e) {
      const a = e.target && e.target.closest && e.target.closest('a[target="_blank"]');
      if (a && a.href) {
        e.preventDefault();
        try { window.location.href = a.href; } catch (err) {}
      }
    }, true);
  } catch (e) {}
  return true;
})()"#;

/// Cheapest possible round trip through the page's JS context.
pub const LIVENESS_PROBE: &str = "1";
