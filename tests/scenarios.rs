//! End-to-end scenarios against a booted kernel: mounting, bind
//! mounts, union overlays, pivot_root, namespaces, and the
//! reference-counting properties that hold them together.

use kvfs::fs::path::Path;
use kvfs::fs::stat::{T_DIR, T_FILE};
use kvfs::fs::{DIRENT_SIZE, ROOTINO};
use kvfs::mkfs::{mkfs, MkfsConfig};
use kvfs::param::ROOTDEV;
use kvfs::sysfile::{self, OpenFlags};
use kvfs::sysmount::{self, UnshareFlags};
use kvfs::{Kernel, KernelError, Proc};

const INIT_CONTENT: &[u8] = b"boot: hello from init\n";

fn boot() -> (Kernel, Proc) {
    let k = Kernel::new();
    let image = mkfs(MkfsConfig::default(), &[(&b"init"[..], INIT_CONTENT)]);
    k.devices.install_ide_image(ROOTDEV, image);
    k.mount_root(ROOTDEV).unwrap();
    let p = Proc::new_init(&k);
    (k, p)
}

fn path(s: &[u8]) -> &Path {
    Path::new(s)
}

/// A small image suitable for a file-backed loop device.
fn small_image() -> Vec<u8> {
    mkfs(
        MkfsConfig {
            size: 200,
            ninodes: 32,
            nlog: 31,
        },
        &[],
    )
}

fn write_new(k: &Kernel, p: &Proc, name: &[u8], data: &[u8]) {
    let f = sysfile::open(
        k,
        p,
        path(name),
        OpenFlags::CREATE | OpenFlags::RDWR,
    )
    .unwrap();
    let n = sysfile::write_file(k, f.ip, data, 0).unwrap();
    assert_eq!(n, data.len());
    sysfile::close(k, f);
}

fn read_all(k: &Kernel, p: &Proc, name: &[u8]) -> Vec<u8> {
    let f = sysfile::open(k, p, path(name), OpenFlags::RDONLY).unwrap();
    let st = sysfile::stat(k, p, path(name)).unwrap();
    let mut buf = vec![0u8; st.size as usize];
    let n = sysfile::read_file(k, f.ip, 0, &mut buf).unwrap();
    buf.truncate(n);
    sysfile::close(k, f);
    buf
}

#[test]
fn s1_boot_mounts_root_and_reads_init() {
    let (k, p) = boot();

    let st = sysfile::stat(&k, &p, path(b"/")).unwrap();
    assert_eq!(st.typ, T_DIR);
    assert_eq!(st.ino, ROOTINO);
    assert!(st.size > 0);

    let f = sysfile::open(&k, &p, path(b"/init"), OpenFlags::RDONLY).unwrap();
    let mut buf = vec![0u8; 64];
    let n = sysfile::read_file(&k, f.ip, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], INIT_CONTENT);
    sysfile::close(&k, f);

    p.exit(&k);
}

#[test]
fn s2_mount_shadows_and_umount_restores() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/a")).unwrap();
    write_new(&k, &p, b"/a/f", b"hello");

    write_new(&k, &p, b"/img", &small_image());
    sysmount::sys_mount(&k, &p, b"/img", b"/a", b"native").unwrap();

    // The mounted (empty) filesystem shadows /a/f.
    assert_eq!(
        sysfile::open(&k, &p, path(b"/a/f"), OpenFlags::RDONLY).err(),
        Some(KernelError::NoEnt)
    );
    // But the mounted root itself resolves.
    let st = sysfile::stat(&k, &p, path(b"/a")).unwrap();
    assert_eq!(st.ino, ROOTINO);

    sysmount::sys_umount(&k, &p, b"/a").unwrap();
    assert_eq!(read_all(&k, &p, b"/a/f"), b"hello");

    // The loop device died with its last inode, so the backing file
    // is deletable again.
    sysfile::unlink(&k, &p, path(b"/img")).unwrap();

    p.exit(&k);
}

#[test]
fn s3_bind_mount_aliases_the_directory() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/a")).unwrap();
    write_new(&k, &p, b"/a/f", b"via a");
    sysfile::mkdir(&k, &p, path(b"/b")).unwrap();

    sysmount::sys_mount(&k, &p, b"/a", b"/b", b"bind").unwrap();

    let sa = sysfile::stat(&k, &p, path(b"/a")).unwrap();
    let sb = sysfile::stat(&k, &p, path(b"/b")).unwrap();
    assert_eq!(sa.ino, sb.ino);
    assert_eq!(sa.dev, sb.dev);

    // Writes through one name are visible through the other.
    let f = sysfile::open(&k, &p, path(b"/b/f"), OpenFlags::RDWR).unwrap();
    sysfile::write_file(&k, f.ip, b"via b", 0).unwrap();
    sysfile::close(&k, f);
    assert_eq!(read_all(&k, &p, b"/a/f"), b"via b");

    sysmount::sys_umount(&k, &p, b"/b").unwrap();
    assert_eq!(read_all(&k, &p, b"/a/f"), b"via b");
    assert_eq!(
        sysfile::open(&k, &p, path(b"/b/f"), OpenFlags::RDONLY).err(),
        Some(KernelError::NoEnt)
    );

    p.exit(&k);
}

#[test]
fn s4_union_lookup_and_copy_up() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/low")).unwrap();
    write_new(&k, &p, b"/low/file", b"l0f\n");
    sysfile::mkdir(&k, &p, path(b"/up")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/ut")).unwrap();

    sysmount::sys_mount(&k, &p, b"/up;/low", b"/ut", b"union").unwrap();

    // Lower-layer content shows through.
    assert_eq!(read_all(&k, &p, b"/ut/file"), b"l0f\n");

    // First write copies the file up to the top layer.
    let f = sysfile::open(&k, &p, path(b"/ut/file"), OpenFlags::WRONLY).unwrap();
    sysfile::write_file(&k, f.ip, b"X", 0).unwrap();
    sysfile::close(&k, f);

    assert_eq!(read_all(&k, &p, b"/ut/file"), b"X0f\n");

    sysmount::sys_umount(&k, &p, b"/ut").unwrap();

    // The copied-up file landed in /up; the lower layer is untouched.
    assert_eq!(read_all(&k, &p, b"/up/file"), b"X0f\n");
    assert_eq!(read_all(&k, &p, b"/low/file"), b"l0f\n");

    p.exit(&k);
}

#[test]
fn union_shadowing_and_merged_readdir() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/low")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/up")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/ut")).unwrap();
    write_new(&k, &p, b"/up/s", b"top");
    write_new(&k, &p, b"/low/s", b"bottom");
    write_new(&k, &p, b"/low/only", b"deep");

    sysmount::sys_mount(&k, &p, b"/up;/low", b"/ut", b"union").unwrap();

    // A name present in both layers resolves to the top layer.
    assert_eq!(read_all(&k, &p, b"/ut/s"), b"top");
    // Deeper layers' entries remain discoverable.
    assert_eq!(read_all(&k, &p, b"/ut/only"), b"deep");

    // The merged directory stream deduplicates by name, first
    // occurrence wins.
    let f = sysfile::open(&k, &p, path(b"/ut"), OpenFlags::RDONLY).unwrap();
    let mut buf = vec![0u8; 64 * DIRENT_SIZE];
    let n = sysfile::read_file(&k, f.ip, 0, &mut buf).unwrap();
    sysfile::close(&k, f);
    assert_eq!(n % DIRENT_SIZE, 0);

    let mut names = Vec::new();
    for entry in buf[..n].chunks(DIRENT_SIZE) {
        let name_end = entry[2..].iter().position(|&b| b == 0).unwrap_or(14);
        names.push(entry[2..2 + name_end].to_vec());
    }
    let unique: std::collections::HashSet<_> = names.iter().cloned().collect();
    assert_eq!(unique.len(), names.len(), "duplicate names in merged stream");
    assert!(names.contains(&b"s".to_vec()));
    assert!(names.contains(&b"only".to_vec()));

    sysmount::sys_umount(&k, &p, b"/ut").unwrap();
    p.exit(&k);
}

#[test]
fn union_copy_up_is_idempotent() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/low")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/up")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/ut")).unwrap();
    write_new(&k, &p, b"/low/f", b"aaaa");

    sysmount::sys_mount(&k, &p, b"/up;/low", b"/ut", b"union").unwrap();

    let f = sysfile::open(&k, &p, path(b"/ut/f"), OpenFlags::WRONLY).unwrap();
    sysfile::write_file(&k, f.ip, b"b", 0).unwrap();
    // A second write through the same handle must not re-copy or
    // change the inode's identity.
    sysfile::write_file(&k, f.ip, b"c", 1).unwrap();
    sysfile::close(&k, f);

    let f = sysfile::open(&k, &p, path(b"/ut/f"), OpenFlags::WRONLY).unwrap();
    sysfile::write_file(&k, f.ip, b"d", 2).unwrap();
    sysfile::close(&k, f);

    assert_eq!(read_all(&k, &p, b"/ut/f"), b"bcda");
    assert_eq!(read_all(&k, &p, b"/low/f"), b"aaaa");

    sysmount::sys_umount(&k, &p, b"/ut").unwrap();
    assert_eq!(read_all(&k, &p, b"/up/f"), b"bcda");
    p.exit(&k);
}

#[test]
fn s5_pivot_root_swaps_the_namespace_root() {
    let (k, p) = boot();

    let ide_dev = sysfile::stat(&k, &p, path(b"/")).unwrap().dev;

    sysfile::mkdir(&k, &p, path(b"/newroot")).unwrap();
    write_new(&k, &p, b"/img", &small_image());
    sysmount::sys_mount(&k, &p, b"/img", b"/newroot", b"native").unwrap();
    sysfile::mkdir(&k, &p, path(b"/newroot/oldroot")).unwrap();

    sysmount::sys_pivot_root(&k, &p, b"/newroot", b"/newroot/oldroot").unwrap();

    // "/" is now the loop filesystem.
    let st = sysfile::stat(&k, &p, path(b"/")).unwrap();
    assert_eq!(st.ino, ROOTINO);
    assert_ne!(st.dev, ide_dev);

    // The old root is reachable under /oldroot.
    let st = sysfile::stat(&k, &p, path(b"/oldroot")).unwrap();
    assert_eq!(st.ino, ROOTINO);
    assert_eq!(st.dev, ide_dev);
    assert_eq!(read_all(&k, &p, b"/oldroot/init"), INIT_CONTENT);

    p.exit(&k);
}

#[test]
fn s6_open_file_makes_umount_busy() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/a")).unwrap();
    write_new(&k, &p, b"/img", &small_image());
    sysmount::sys_mount(&k, &p, b"/img", b"/a", b"native").unwrap();

    write_new(&k, &p, b"/a/f", b"kept open");
    let f = sysfile::open(&k, &p, path(b"/a/f"), OpenFlags::RDONLY).unwrap();

    assert_eq!(
        sysmount::sys_umount(&k, &p, b"/a").err(),
        Some(KernelError::Busy)
    );

    sysfile::close(&k, f);
    sysmount::sys_umount(&k, &p, b"/a").unwrap();

    p.exit(&k);
}

#[test]
fn mount_rejects_duplicates_and_root() {
    use kvfs::fs::namei::{namei, nameimount};
    use kvfs::mount::{self, MountReq};

    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/a")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/b")).unwrap();

    // No two active mounts may share (parent, mountpoint). The
    // syscall path can't produce the collision (resolution crosses
    // the first mount), so drive the mount table directly.
    let (a_ip, parent) = nameimount(&k, &p, path(b"/a")).unwrap();
    let b_ip = namei(&k, &p, path(b"/b")).unwrap();
    mount::mount(&k, p.ns, Some(a_ip), MountReq::Bind(b_ip), Some(parent)).unwrap();

    let a_again = a_ip.dup(&k);
    assert_eq!(
        mount::mount(&k, p.ns, Some(a_again), MountReq::Bind(b_ip), Some(parent)).err(),
        Some(KernelError::Exist)
    );
    a_again.put(&k);
    b_ip.put(&k);
    mount::mntput(&k, parent);

    // Filesystem roots cannot be mounted over.
    assert_eq!(
        sysmount::sys_mount(&k, &p, b"/b", b"/", b"bind").err(),
        Some(KernelError::Inval)
    );
    // Unmounting a plain directory is refused.
    assert_eq!(
        sysmount::sys_umount(&k, &p, b"/b").err(),
        Some(KernelError::Inval)
    );

    sysmount::sys_umount(&k, &p, b"/a").unwrap();
    p.exit(&k);
}

#[test]
fn objfs_supports_the_usual_file_operations() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/o")).unwrap();
    sysmount::sys_mount(&k, &p, b"", b"/o", b"objfs").unwrap();

    write_new(&k, &p, b"/o/hello", b"object world");
    assert_eq!(read_all(&k, &p, b"/o/hello"), b"object world");

    sysfile::mkdir(&k, &p, path(b"/o/dir")).unwrap();
    write_new(&k, &p, b"/o/dir/nested", b"deep");
    assert_eq!(read_all(&k, &p, b"/o/dir/nested"), b"deep");

    let st = sysfile::stat(&k, &p, path(b"/o/hello")).unwrap();
    assert_eq!(st.typ, T_FILE);
    assert_eq!(st.size, 12);

    sysfile::unlink(&k, &p, path(b"/o/hello")).unwrap();
    assert_eq!(
        sysfile::stat(&k, &p, path(b"/o/hello")).err(),
        Some(KernelError::NoEnt)
    );

    sysfile::unlink(&k, &p, path(b"/o/dir/nested")).unwrap();
    sysfile::unlink(&k, &p, path(b"/o/dir")).unwrap();
    sysmount::sys_umount(&k, &p, b"/o").unwrap();
    p.exit(&k);
}

#[test]
fn proc_and_cgroup_are_real_mounts() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/proc")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/cg")).unwrap();
    sysmount::sys_mount(&k, &p, b"", b"/proc", b"proc").unwrap();
    sysmount::sys_mount(&k, &p, b"", b"/cg", b"cgroup").unwrap();

    let mounts = read_all(&k, &p, b"/proc/mounts");
    let text = String::from_utf8(mounts).unwrap();
    assert!(text.contains("native"), "mounts: {}", text);
    assert!(text.contains("proc"), "mounts: {}", text);
    assert!(text.contains("cgroup"), "mounts: {}", text);

    let fss = read_all(&k, &p, b"/proc/filesystems");
    assert!(String::from_utf8(fss).unwrap().contains("union"));

    // Synthetic files reject writes.
    let f = sysfile::open(&k, &p, path(b"/cg/cgroup.procs"), OpenFlags::RDWR).unwrap();
    assert_eq!(
        sysfile::write_file(&k, f.ip, b"1", 0).err(),
        Some(KernelError::Inval)
    );
    sysfile::close(&k, f);

    // Both unmount through the regular path.
    sysmount::sys_umount(&k, &p, b"/cg").unwrap();
    sysmount::sys_umount(&k, &p, b"/proc").unwrap();
    p.exit(&k);
}

#[test]
fn namespace_isolation_after_unshare() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/shared")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/priv")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/payload")).unwrap();
    write_new(&k, &p, b"/payload/x", b"pre-existing");
    sysmount::sys_mount(&k, &p, b"/payload", b"/shared", b"bind").unwrap();

    let mut child = p.fork(&k);
    sysmount::sys_unshare(&k, &mut child, UnshareFlags::MOUNT_NS).unwrap();

    // Pre-existing mounts are visible in both namespaces.
    assert_eq!(read_all(&k, &p, b"/shared/x"), b"pre-existing");
    assert_eq!(read_all(&k, &child, b"/shared/x"), b"pre-existing");

    // A mount added in the child is invisible in the parent.
    sysmount::sys_mount(&k, &child, b"", b"/priv", b"objfs").unwrap();
    write_new(&k, &child, b"/priv/secret", b"child only");
    assert_eq!(read_all(&k, &child, b"/priv/secret"), b"child only");
    assert_eq!(
        sysfile::stat(&k, &p, path(b"/priv/secret")).err(),
        Some(KernelError::NoEnt)
    );

    // Unmounting in one namespace does not affect the other.
    sysmount::sys_umount(&k, &child, b"/shared").unwrap();
    assert_eq!(
        sysfile::stat(&k, &child, path(b"/shared/x")).err(),
        Some(KernelError::NoEnt)
    );
    assert_eq!(read_all(&k, &p, b"/shared/x"), b"pre-existing");

    // Child exit unmounts its private tree.
    child.exit(&k);
    assert_eq!(read_all(&k, &p, b"/shared/x"), b"pre-existing");
    sysmount::sys_umount(&k, &p, b"/shared").unwrap();
    p.exit(&k);
}

#[test]
fn inode_refcounts_are_conserved() {
    let (k, p) = boot();

    write_new(&k, &p, b"/f", b"counted");

    let ip = kvfs::fs::namei::namei(&k, &p, path(b"/f")).unwrap();
    let before = ip.meta(&k).refcnt;

    let ip2 = ip.dup(&k);
    assert_eq!(ip.meta(&k).refcnt, before + 1);
    ip2.put(&k);
    assert_eq!(ip.meta(&k).refcnt, before);

    // Resolving the same path again lands on the same cache slot.
    let ip3 = kvfs::fs::namei::namei(&k, &p, path(b"/f")).unwrap();
    assert_eq!(ip3, ip);
    assert_eq!(ip.meta(&k).refcnt, before + 1);
    ip3.put(&k);
    ip.put(&k);
    assert_eq!(ip2.meta(&k).refcnt, before - 1);

    p.exit(&k);
}

#[test]
fn unlink_with_no_links_frees_the_inode() {
    let (k, p) = boot();

    write_new(&k, &p, b"/doomed", b"short life");
    let st = sysfile::stat(&k, &p, path(b"/doomed")).unwrap();

    sysfile::link(&k, &p, path(b"/doomed"), path(b"/spare")).unwrap();
    let st2 = sysfile::stat(&k, &p, path(b"/spare")).unwrap();
    assert_eq!(st.ino, st2.ino);
    assert_eq!(st2.nlink, 2);

    sysfile::unlink(&k, &p, path(b"/doomed")).unwrap();
    assert_eq!(read_all(&k, &p, b"/spare"), b"short life");
    sysfile::unlink(&k, &p, path(b"/spare")).unwrap();

    // The inode number is recyclable: a fresh file may take it.
    write_new(&k, &p, b"/fresh", b"new tenant");
    let st3 = sysfile::stat(&k, &p, path(b"/fresh")).unwrap();
    assert_eq!(st3.nlink, 1);

    p.exit(&k);
}

#[test]
fn dot_and_dotdot_resolve_across_mounts() {
    let (k, p) = boot();

    sysfile::mkdir(&k, &p, path(b"/a")).unwrap();
    sysfile::mkdir(&k, &p, path(b"/a/b")).unwrap();
    write_new(&k, &p, b"/tag", b"root tag");

    // ".." climbs out of a mounted filesystem through its mountpoint.
    write_new(&k, &p, b"/img", &small_image());
    sysmount::sys_mount(&k, &p, b"/img", b"/a/b", b"native").unwrap();
    assert_eq!(read_all(&k, &p, b"/a/b/../../tag"), b"root tag");
    assert_eq!(read_all(&k, &p, b"/a/./b/./../../tag"), b"root tag");

    sysmount::sys_umount(&k, &p, b"/a/b").unwrap();
    p.exit(&k);
}

#[test]
fn two_writers_serialize_on_the_inode_lock() {
    let (k, p) = boot();
    write_new(&k, &p, b"/shared", &[0u8; 512]);
    let f = sysfile::open(&k, &p, path(b"/shared"), OpenFlags::RDWR).unwrap();
    let ip = f.ip;

    std::thread::scope(|s| {
        for byte in [0x11u8, 0x22u8] {
            let k = &k;
            s.spawn(move || {
                for _ in 0..20 {
                    sysfile::write_file(k, ip, &[byte; 512], 0).unwrap();
                }
            });
        }
    });

    let mut buf = [0u8; 512];
    let n = sysfile::read_file(&k, ip, 0, &mut buf).unwrap();
    assert_eq!(n, 512);
    // Writes are serialized at writei granularity: the result is one
    // of the two patterns, never interleaved.
    assert!(buf.iter().all(|&b| b == buf[0]));
    assert!(buf[0] == 0x11 || buf[0] == 0x22);

    sysfile::close(&k, f);
    p.exit(&k);
}

#[test]
fn log_recovery_replays_a_committed_transaction() {
    use kvfs::fs::native::{DINODE_SIZE, IPB};
    use kvfs::param::BSIZE;

    // An image whose on-disk log claims a committed-but-uninstalled
    // transaction: the victim file's data block should really contain
    // "NEW". Recovery at mount time must replay it.
    let mut image = mkfs(MkfsConfig::default(), &[(&b"victim"[..], &b"OLD"[..])]);

    let u32_at = |img: &[u8], off: usize| {
        u32::from_le_bytes([img[off], img[off + 1], img[off + 2], img[off + 3]])
    };
    let logstart = u32_at(&image, BSIZE + 16) as usize;
    let inodestart = u32_at(&image, BSIZE + 20) as usize;

    // The victim is inum 2 (the root directory is 1); its first data
    // block address sits right after the fixed dinode header fields.
    let dinode = inodestart * BSIZE + (2 % IPB) * DINODE_SIZE;
    let data_block = u32_at(&image, dinode + 12) as usize;
    assert_ne!(data_block, 0);

    // Log header: one block, destined for the victim's data block.
    let head = logstart * BSIZE;
    image[head..head + 4].copy_from_slice(&1u32.to_le_bytes());
    image[head + 4..head + 8].copy_from_slice(&(data_block as u32).to_le_bytes());
    // Log body: the replacement contents.
    let body = (logstart + 1) * BSIZE;
    image[body..body + BSIZE].fill(0);
    image[body..body + 3].copy_from_slice(b"NEW");

    let k = Kernel::new();
    k.devices.install_ide_image(ROOTDEV, image);
    k.mount_root(ROOTDEV).unwrap();
    let p = Proc::new_init(&k);

    assert_eq!(read_all(&k, &p, b"/victim"), b"NEW");
    p.exit(&k);
}
