// API middleware. The gateway's only inbound surface is the websocket
// upgrade in `routes::gateway`, which verifies its token inline (spec §4.G);
// there is no separate REST auth layer to mount here. CORS is wired directly
// in `lib.rs` via `tower_http`.
