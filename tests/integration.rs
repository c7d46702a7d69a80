use std::{
    io::{Cursor, Read, Write},
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD};
use kmsenvelope::{
    CachedKeyWrapper, Dek, EnvelopeCrypter, EnvelopeError, KeyWrapper, KmsKeyWrapper, WrappedKey,
    cipher::StreamCipher,
    kms::{KmsClient, local::LocalKms},
};

/// Local KMS that counts unwrap calls and can be switched off.
struct CountingKms {
    inner: LocalKms,
    decrypts: AtomicUsize,
    down: AtomicBool,
}

impl CountingKms {
    fn new() -> Self {
        Self {
            inner: LocalKms::from_bytes([0x5C; 32]),
            decrypts: AtomicUsize::new(0),
            down: AtomicBool::new(false),
        }
    }

    fn decrypts(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl KmsClient for CountingKms {
    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("kms unreachable");
        }
        self.inner.decrypt(ciphertext)
    }

    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.inner.encrypt(plaintext)
    }
}

type Cached = CachedKeyWrapper<KmsKeyWrapper<CountingKms>>;

/// Cached KMS wrapper plus a freshly minted wrapped DEK.
fn setup(ttl: Duration) -> Result<(Arc<Cached>, WrappedKey)> {
    let wrapper = Arc::new(CachedKeyWrapper::new(KmsKeyWrapper::new(CountingKms::new()), ttl));
    let wrapped = wrapper.inner().wrap_key(&Dek::from_bytes(vec![0x24; 32]))?;
    Ok((wrapper, wrapped))
}

fn kms(wrapper: &Cached) -> &CountingKms {
    wrapper.inner().client()
}

fn crypter_for(wrapper: &Arc<Cached>, wrapped: &WrappedKey) -> EnvelopeCrypter {
    EnvelopeCrypter::from_key(
        STANDARD.encode(wrapped.as_bytes()),
        wrapper.clone(),
        Arc::new(StreamCipher),
    )
}

fn encrypt(crypter: &EnvelopeCrypter, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = crypter.encrypt(&mut out)?;
        writer.write_all(payload)?;
        writer.close()?;
    }
    Ok(out)
}

fn decrypt(crypter: &EnvelopeCrypter, data: Vec<u8>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    crypter.decrypt(Cursor::new(data))?.read_to_end(&mut out)?;
    Ok(out)
}

#[test]
fn test_round_trip() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::ZERO)?;
    let crypter = crypter_for(&wrapper, &wrapped);

    for size in [0usize, 1, 1000, 200_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        let sealed = encrypt(&crypter, &payload)?;
        assert_eq!(decrypt(&crypter, sealed)?, payload, "payload of {size} bytes");
    }
    Ok(())
}

#[test]
fn test_header_precedes_ciphertext() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::ZERO)?;
    let crypter = crypter_for(&wrapper, &wrapped);

    let sealed = encrypt(&crypter, b"payload")?;
    let header = wrapper.serialize_wrapped_key(&wrapped);
    assert!(sealed.starts_with(&header));

    let mut cursor = Cursor::new(sealed);
    assert_eq!(wrapper.read_wrapped_key(&mut cursor)?, wrapped);
    assert_eq!(cursor.position() as usize, header.len());
    Ok(())
}

#[test]
fn test_cache_hit_avoids_kms() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::from_secs(3600))?;
    let crypter = crypter_for(&wrapper, &wrapped);

    let sealed = encrypt(&crypter, b"cached")?;
    assert_eq!(decrypt(&crypter, sealed.clone())?, b"cached");
    assert_eq!(decrypt(&crypter, sealed)?, b"cached");
    assert_eq!(kms(&wrapper).decrypts(), 1, "only the first unwrap reaches the KMS");
    Ok(())
}

#[test]
fn test_stale_key_served_during_outage() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::from_millis(1))?;
    let crypter = crypter_for(&wrapper, &wrapped);

    let sealed = encrypt(&crypter, b"still readable")?;
    thread::sleep(Duration::from_millis(20));

    kms(&wrapper).set_down(true);
    assert_eq!(decrypt(&crypter, sealed)?, b"still readable");
    assert_eq!(kms(&wrapper).decrypts(), 2, "the stale entry was refreshed first");
    Ok(())
}

#[test]
fn test_cold_miss_propagates_kms_error() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::ZERO)?;
    // Same master key, separate cache.
    let (other, _) = setup(Duration::ZERO)?;
    let writer_side = encrypt(&crypter_for(&other, &wrapped), b"secret")?;

    kms(&wrapper).set_down(true);
    let crypter = crypter_for(&wrapper, &wrapped);
    match crypter.decrypt(Cursor::new(writer_side)) {
        Err(EnvelopeError::Kms(_)) => {}
        Err(other) => panic!("expected kms error, got {other}"),
        Ok(_) => panic!("decrypt succeeded with the KMS down"),
    }
    assert!(wrapper.is_empty());
    Ok(())
}

#[test]
fn test_truncated_stream_rejected() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::ZERO)?;
    let crypter = crypter_for(&wrapper, &wrapped);

    let sealed = encrypt(&crypter, &vec![1u8; 100_000])?;
    let cut = sealed[..sealed.len() - 10].to_vec();
    assert!(decrypt(&crypter, cut).is_err());

    let header_only = wrapper.serialize_wrapped_key(&wrapped);
    assert!(decrypt(&crypter, header_only[..header_only.len() - 1].to_vec()).is_err());
    Ok(())
}

#[test]
fn test_concurrent_key_file_setup() -> Result<()> {
    let (wrapper, wrapped) = setup(Duration::ZERO)?;
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "{}", STANDARD.encode(wrapped.as_bytes()))?;

    let crypter = Arc::new(EnvelopeCrypter::from_key_path(
        file.path(),
        wrapper.clone(),
        Arc::new(StreamCipher),
    ));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let crypter = crypter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                crypter.setup_wrapped_key()
            })
        })
        .collect();
    for handle in handles {
        let key = handle.join().expect("setup thread panicked")?;
        assert_eq!(key, wrapped);
    }

    // The file is never consulted again once resolved.
    let path = file.path().to_path_buf();
    file.close()?;
    assert!(!path.exists());
    assert_eq!(crypter.setup_wrapped_key()?, wrapped);
    assert_eq!(decrypt(&crypter, encrypt(&crypter, b"after removal")?)?, b"after removal");
    Ok(())
}
